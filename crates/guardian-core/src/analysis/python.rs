//! Python syntax walker

use super::patterns::{refuses_without_confirmation, CONFIRM};
use super::{
    collapse, line_span, location, named_children, parse, text, unquote, CallFact, FunctionFact,
    GlobalKind, LoopFact, Pattern, Scope, SourceFacts, SourceLanguage, StubKind,
};
use crate::error::AnalysisError;
use tree_sitter::Node;

const LITERAL_KINDS: &[&str] = &["integer", "float", "string", "true", "false", "none"];
const MUTABLE_LITERALS: &[&str] = &[
    "list",
    "dictionary",
    "set",
    "list_comprehension",
    "dictionary_comprehension",
    "set_comprehension",
];

pub(super) fn analyze(source: &str) -> Result<SourceFacts, AnalysisError> {
    let tree = parse(tree_sitter_python::language(), "python", source)?;
    let root = tree.root_node();

    let mut walker = Walker {
        source,
        facts: SourceFacts {
            language: SourceLanguage::Python,
            line_count: source.lines().count(),
            ..SourceFacts::default()
        },
    };
    if let Some(first) = root.named_child(0) {
        if is_docstring(first) {
            walker.push(Pattern::ModuleDoc, first);
        }
    }
    walker.block(root, &Scope::default());
    Ok(walker.facts)
}

fn is_docstring(node: Node<'_>) -> bool {
    node.kind() == "expression_statement"
        && node.named_child_count() == 1
        && node.named_child(0).map_or(false, |c| c.kind() == "string")
}

struct Walker<'s> {
    source: &'s str,
    facts: SourceFacts,
}

impl<'s> Walker<'s> {
    fn text(&self, node: Node<'_>) -> &'s str {
        text(node, self.source)
    }

    fn field_text(&self, node: Node<'_>, field: &str) -> &'s str {
        node.child_by_field_name(field)
            .map(|child| self.text(child))
            .unwrap_or("")
    }

    fn push(&mut self, pattern: Pattern, node: Node<'_>) {
        self.facts.push(pattern, location(node));
    }

    /// Statements in order; a guard clause protects the statements after it
    fn block(&mut self, node: Node<'_>, scope: &Scope) {
        let mut scope = scope.clone();
        for child in named_children(node) {
            self.visit(child, &scope);
            if self.is_guard_clause(child) {
                scope.guarded = true;
            }
        }
    }

    fn is_guard_clause(&self, node: Node<'_>) -> bool {
        match node.kind() {
            "if_statement" => {
                let consequence = self.field_text(node, "consequence");
                refuses_without_confirmation(self.field_text(node, "condition"))
                    && ["return", "raise", "exit", "abort"]
                        .iter()
                        .any(|exit| consequence.contains(exit))
            }
            "expression_statement" => node
                .named_child(0)
                .filter(|child| child.kind() == "call")
                .map_or(false, |call| CONFIRM.is_match(self.field_text(call, "function"))),
            _ => false,
        }
    }

    fn visit(&mut self, node: Node<'_>, scope: &Scope) {
        match node.kind() {
            "block" => self.block(node, scope),
            "function_definition" => self.function(node, scope, &[]),
            "class_definition" => self.class(node, scope, &[]),
            "decorated_definition" => self.decorated(node, scope),
            "if_statement" | "elif_clause" => self.conditional(node, scope),
            "try_statement" => self.try_statement(node, scope),
            "for_statement" => self.for_loop(node, scope),
            "while_statement" => {
                self.push(
                    Pattern::Loop(LoopFact {
                        iterable: String::new(),
                        nested_same_iterable: false,
                        depth: scope.loop_iterables.len() + 1,
                    }),
                    node,
                );
                self.walk_children(node, scope);
            }
            "call" => self.call(node, scope),
            "raise_statement" => self.raise(node, scope),
            "global_statement" => {
                let names = named_children(node)
                    .into_iter()
                    .map(|n| self.text(n))
                    .collect::<Vec<_>>()
                    .join(", ");
                self.push(
                    Pattern::MutableGlobal {
                        name: names,
                        kind: GlobalKind::GlobalStatement,
                    },
                    node,
                );
            }
            "expression_statement" => {
                if scope.function.is_none() {
                    self.module_assignment(node);
                }
                self.walk_children(node, scope);
            }
            "comment" => {
                let text = self.text(node).trim_start_matches('#').trim().to_string();
                self.push(Pattern::Comment { text }, node);
            }
            _ => self.walk_children(node, scope),
        }
    }

    fn walk_children(&mut self, node: Node<'_>, scope: &Scope) {
        for child in named_children(node) {
            self.visit(child, scope);
        }
    }

    fn conditional(&mut self, node: Node<'_>, scope: &Scope) {
        let condition = node.child_by_field_name("condition");
        let guarded = scope.under_condition(condition.map(|c| self.text(c)).unwrap_or(""));
        let consequence = node.child_by_field_name("consequence");
        for child in named_children(node) {
            if Some(child) == consequence {
                self.visit(child, &guarded);
            } else {
                self.visit(child, scope);
            }
        }
    }

    fn decorated(&mut self, node: Node<'_>, scope: &Scope) {
        let decorators: Vec<String> = named_children(node)
            .into_iter()
            .filter(|child| child.kind() == "decorator")
            .map(|child| self.text(child).to_string())
            .collect();
        match node.child_by_field_name("definition") {
            Some(def) if def.kind() == "function_definition" => self.function(def, scope, &decorators),
            Some(def) if def.kind() == "class_definition" => self.class(def, scope, &decorators),
            Some(def) => self.visit(def, scope),
            None => {}
        }
    }

    fn class(&mut self, node: Node<'_>, scope: &Scope, decorators: &[String]) {
        let name = self.field_text(node, "name");
        let bases = self.field_text(node, "superclasses");
        let is_test_class = name.starts_with("Test");
        if is_test_class {
            self.facts.test_ranges.push(line_span(node));
        }

        let inner = Scope {
            in_test: scope.in_test || is_test_class,
            abstract_class: ["ABC", "Protocol", "ABCMeta"]
                .iter()
                .any(|base| bases.contains(base))
                || decorators.iter().any(|d| d.contains("runtime_checkable")),
            ..scope.clone()
        };
        if let Some(body) = node.child_by_field_name("body") {
            self.block(body, &inner);
        }
    }

    fn function(&mut self, node: Node<'_>, scope: &Scope, decorators: &[String]) {
        let name = self.field_text(node, "name").to_string();
        let (params, all_typed) = node
            .child_by_field_name("parameters")
            .map(|p| self.parameters(p))
            .unwrap_or((Vec::new(), true));
        let annotated = all_typed && node.child_by_field_name("return_type").is_some();
        let body = node.child_by_field_name("body");
        let doc = body
            .and_then(|b| b.named_child(0))
            .filter(|first| is_docstring(*first))
            .map(|first| unquote(self.text(first).trim()).trim().to_string());

        let is_fixture = decorators.iter().any(|d| d.contains("fixture"));
        let is_test = name.starts_with("test_") || (scope.in_test && name.starts_with("test"));
        let in_test_scope = scope.in_test || is_test || is_fixture;
        let span = line_span(node);
        if is_test || is_fixture {
            self.facts.test_ranges.push(span);
        }

        let stub = body.and_then(|b| self.stub_kind(b, &params, doc.is_some()));
        let deprecated = decorators.iter().any(|d| d.contains("deprecated"))
            || body.map_or(false, |b| self.text(b).contains("DeprecationWarning"));
        let abstract_like = scope.abstract_class
            || decorators.iter().any(|d| {
                d.contains("abstractmethod") || d.contains("overload") || d.contains("abc.")
            });

        let before = self.facts.findings.len();
        if let Some(body) = body {
            let inner = Scope {
                in_test: in_test_scope,
                in_try: false,
                guarded: scope.guarded,
                function: Some(name.clone()),
                loop_iterables: Vec::new(),
                abstract_class: false,
                depth: scope.depth + 1,
            };
            self.block(body, &inner);
        }
        let handles_errors = self.facts.findings[before..]
            .iter()
            .any(|f| matches!(f.pattern, Pattern::ErrorHandler));

        if is_test {
            self.push(Pattern::TestFunction { name }, node);
            return;
        }
        self.push(
            Pattern::Function(FunctionFact {
                public: !name.starts_with('_') && scope.function.is_none(),
                name,
                doc,
                params,
                annotated,
                stub,
                abstract_like,
                handles_errors,
                deprecated,
                line_count: span.1 - span.0 + 1,
                in_test_scope,
            }),
            node,
        );
    }

    /// Parameter names (without `self`/`cls`) and whether all are annotated
    fn parameters(&self, node: Node<'_>) -> (Vec<String>, bool) {
        let mut names = Vec::new();
        let mut all_typed = true;
        for param in named_children(node) {
            let Some(name) = self.parameter_name(param) else {
                continue;
            };
            if name == "self" || name == "cls" {
                continue;
            }
            all_typed &= param.kind().starts_with("typed_");
            names.push(name);
        }
        (names, all_typed)
    }

    fn parameter_name(&self, node: Node<'_>) -> Option<String> {
        match node.kind() {
            "identifier" => Some(self.text(node).to_string()),
            "typed_parameter" => node.named_child(0).and_then(|n| self.parameter_name(n)),
            "default_parameter" | "typed_default_parameter" => node
                .child_by_field_name("name")
                .map(|n| self.text(n).to_string()),
            "list_splat_pattern" | "dictionary_splat_pattern" => {
                node.named_child(0).map(|n| self.text(n).to_string())
            }
            _ => None,
        }
    }

    fn stub_kind(&self, body: Node<'_>, params: &[String], has_doc: bool) -> Option<StubKind> {
        let statements: Vec<Node<'_>> = named_children(body)
            .into_iter()
            .filter(|n| n.kind() != "comment")
            .skip(usize::from(has_doc))
            .collect();

        match statements.as_slice() {
            [] => Some(StubKind::DocstringOnly),
            [only] => match only.kind() {
                "pass_statement" => Some(StubKind::Pass),
                "expression_statement"
                    if only.named_child(0).map(|c| c.kind()) == Some("ellipsis") =>
                {
                    Some(StubKind::Ellipsis)
                }
                "raise_statement" if self.text(*only).contains("NotImplementedError") => {
                    Some(StubKind::NotImplemented)
                }
                "return_statement" if !params.is_empty() => {
                    let literal = only
                        .named_child(0)
                        .map_or(true, |value| LITERAL_KINDS.contains(&value.kind()));
                    literal.then_some(StubKind::ConstantReturn)
                }
                _ => None,
            },
            _ => None,
        }
    }

    fn try_statement(&mut self, node: Node<'_>, scope: &Scope) {
        self.push(Pattern::ErrorHandler, node);
        let body = node.child_by_field_name("body");
        let in_try = Scope {
            in_try: true,
            ..scope.clone()
        };
        for child in named_children(node) {
            if Some(child) == body {
                self.visit(child, &in_try);
            } else if child.kind() == "except_clause" {
                self.except_clause(child, scope);
            } else {
                self.visit(child, scope);
            }
        }
    }

    fn except_clause(&mut self, node: Node<'_>, scope: &Scope) {
        let parts = named_children(node);
        let handler = parts.iter().copied().find(|n| n.kind() == "block");
        let catches_type = parts
            .iter()
            .any(|n| n.kind() != "block" && n.kind() != "comment");
        if !catches_type {
            self.push(Pattern::BareExcept, node);
        }
        if let Some(handler) = handler {
            let swallows = named_children(handler)
                .into_iter()
                .filter(|n| n.kind() != "comment")
                .all(|statement| match statement.kind() {
                    "pass_statement" | "continue_statement" => true,
                    "expression_statement" => {
                        statement.named_child(0).map(|c| c.kind()) == Some("ellipsis")
                    }
                    _ => false,
                });
            if swallows {
                self.push(Pattern::SwallowedError, node);
            }
            self.visit(handler, scope);
        }
    }

    fn for_loop(&mut self, node: Node<'_>, scope: &Scope) {
        let iterable = collapse(self.field_text(node, "right"));
        self.push(
            Pattern::Loop(LoopFact {
                nested_same_iterable: !iterable.is_empty()
                    && scope.loop_iterables.contains(&iterable),
                depth: scope.loop_iterables.len() + 1,
                iterable: iterable.clone(),
            }),
            node,
        );

        let mut inner = scope.clone();
        inner.loop_iterables.push(iterable);
        let body = node.child_by_field_name("body");
        for child in named_children(node) {
            if Some(child) == body {
                self.visit(child, &inner);
            } else {
                self.visit(child, scope);
            }
        }
    }

    fn call(&mut self, node: Node<'_>, scope: &Scope) {
        let callee = collapse(self.field_text(node, "function"));
        let arguments = node.child_by_field_name("arguments");
        let string_args = arguments
            .map(|args| {
                named_children(args)
                    .into_iter()
                    .filter(|a| a.kind() == "string")
                    .map(|a| unquote(self.text(a)))
                    .collect()
            })
            .unwrap_or_default();

        self.push(
            Pattern::Call(CallFact {
                callee,
                arguments: arguments.map(|a| self.text(a).to_string()).unwrap_or_default(),
                string_args,
                guarded: scope.guarded,
                in_try: scope.in_try,
                in_test_scope: scope.in_test,
                enclosing_function: scope.function.clone(),
            }),
            node,
        );
        self.walk_children(node, scope);
    }

    fn raise(&mut self, node: Node<'_>, scope: &Scope) {
        // A bare `raise` re-raises the active exception
        if let Some(raised) = node.named_child(0) {
            let (exception, message, literal) = if raised.kind() == "call" {
                let first_arg = raised
                    .child_by_field_name("arguments")
                    .and_then(|args| args.named_child(0));
                (
                    self.field_text(raised, "function").to_string(),
                    first_arg.map(|arg| match arg.kind() {
                        "string" => unquote(self.text(arg)),
                        _ => self.text(arg).to_string(),
                    }),
                    first_arg.map_or(false, |arg| arg.kind() == "string"),
                )
            } else {
                (self.text(raised).to_string(), None, false)
            };
            self.push(
                Pattern::Raise {
                    exception,
                    message,
                    literal,
                },
                node,
            );
        }
        self.walk_children(node, scope);
    }

    /// Module-level bindings of mutable literals to lowercase names
    fn module_assignment(&mut self, node: Node<'_>) {
        let Some(assignment) = node.named_child(0).filter(|n| n.kind() == "assignment") else {
            return;
        };
        let (Some(left), Some(right)) = (
            assignment.child_by_field_name("left"),
            assignment.child_by_field_name("right"),
        ) else {
            return;
        };
        let name = self.text(left);
        let constant_like = name.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
        let dunder = name.starts_with("__") && name.ends_with("__");
        if left.kind() == "identifier"
            && !constant_like
            && !dunder
            && MUTABLE_LITERALS.contains(&right.kind())
        {
            self.push(
                Pattern::MutableGlobal {
                    name: name.to_string(),
                    kind: GlobalKind::MutableLiteral,
                },
                node,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(source: &str) -> SourceFacts {
        analyze(source).unwrap()
    }

    #[test]
    fn test_pass_body_is_stub() {
        let facts = facts("def f(): pass\n");
        let (function, location) = facts.functions().next().unwrap();
        assert_eq!(function.name, "f");
        assert_eq!(function.stub, Some(StubKind::Pass));
        assert!(function.public);
        assert_eq!(location.line, 1);
    }

    #[test]
    fn test_constant_return_ignoring_params_is_stub() {
        let facts = facts("def price(item, qty):\n    return 0\n");
        let (function, _) = facts.functions().next().unwrap();
        assert_eq!(function.stub, Some(StubKind::ConstantReturn));
        assert_eq!(function.params, vec!["item".to_string(), "qty".to_string()]);
    }

    #[test]
    fn test_abstract_methods_are_marked() {
        let facts = facts(
            "from abc import ABC, abstractmethod\n\nclass Store(ABC):\n    @abstractmethod\n    def get(self, key):\n        ...\n",
        );
        let (function, _) = facts.functions().next().unwrap();
        assert_eq!(function.stub, Some(StubKind::Ellipsis));
        assert!(function.abstract_like);
    }

    #[test]
    fn test_docstring_and_annotations() {
        let facts = facts(
            "def add(a: int, b: int) -> int:\n    \"\"\"Add numbers.\n\n    Args:\n        a: left\n    \"\"\"\n    return a + b\n",
        );
        let (function, _) = facts.functions().next().unwrap();
        assert!(function.annotated);
        assert!(function.is_documented());
        assert!(function.doc.as_deref().unwrap().starts_with("Add numbers."));
        assert_eq!(function.stub, None);
    }

    #[test]
    fn test_try_marks_calls_and_swallowed_errors() {
        let facts = facts(
            "def load(path):\n    try:\n        return open(path).read()\n    except:\n        pass\n",
        );
        let open_call = facts.calls().find(|(c, _)| c.callee == "open").unwrap().0;
        assert!(open_call.in_try);
        assert!(facts.has(|p| matches!(p, Pattern::SwallowedError)));
        assert!(facts.has(|p| matches!(p, Pattern::BareExcept)));
        assert!(facts.function_named("load").unwrap().handles_errors);
    }

    #[test]
    fn test_confirmation_guards_calls() {
        let facts = facts(
            "import shutil\n\ndef wipe(path):\n    if confirm(f'delete {path}?'):\n        shutil.rmtree(path)\n\ndef wipe_fast(path):\n    shutil.rmtree(path)\n",
        );
        let guarded: Vec<bool> = facts
            .calls()
            .filter(|(c, _)| c.callee == "shutil.rmtree")
            .map(|(c, _)| c.guarded)
            .collect();
        assert_eq!(guarded, vec![true, false]);
    }

    #[test]
    fn test_guard_clause_protects_following_statements() {
        let facts = facts(
            "def wipe(path, approved):\n    if not approved:\n        return\n    shutil.rmtree(path)\n",
        );
        let call = facts
            .calls()
            .find(|(c, _)| c.callee == "shutil.rmtree")
            .unwrap()
            .0;
        assert!(call.guarded);
    }

    #[test]
    fn test_nested_loop_over_same_collection() {
        let facts = facts(
            "def pairs(items):\n    out = []\n    for a in items:\n        for b in items:\n            out.append((a, b))\n    return out\n",
        );
        let loops: Vec<bool> = facts.loops().map(|(l, _)| l.nested_same_iterable).collect();
        assert_eq!(loops, vec![false, true]);
    }

    #[test]
    fn test_tests_and_globals() {
        let facts = facts(
            "\"\"\"Module doc.\"\"\"\n__version__ = \"1.0\"\nLIMITS = {}\ncache = {}\n\ndef test_cache():\n    assert cache == {}\n",
        );
        assert!(facts.has(|p| matches!(p, Pattern::ModuleDoc)));
        assert!(facts.has_tests());
        let globals: Vec<&Pattern> = facts
            .matching(|p| matches!(p, Pattern::MutableGlobal { .. }))
            .map(|f| &f.pattern)
            .collect();
        assert_eq!(globals.len(), 1);
        assert!(facts.in_test_scope(7));
        assert!(!facts.in_test_scope(4));
    }

    #[test]
    fn test_raise_messages() {
        let facts = facts(
            "def check(x):\n    if x < 0:\n        raise ValueError(\"x must be non-negative\")\n    raise RuntimeError()\n",
        );
        let raises: Vec<(String, Option<String>)> = facts
            .matching(|p| matches!(p, Pattern::Raise { .. }))
            .filter_map(|f| match &f.pattern {
                Pattern::Raise {
                    exception, message, ..
                } => Some((exception.clone(), message.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            raises,
            vec![
                ("ValueError".to_string(), Some("x must be non-negative".to_string())),
                ("RuntimeError".to_string(), None),
            ]
        );
    }
}
