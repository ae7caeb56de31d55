//! Rust syntax walker

use super::patterns::refuses_without_confirmation;
use super::{
    collapse, line_span, location, named_children, parse, text, unquote, CallFact, FunctionFact,
    GlobalKind, LoopFact, Pattern, Scope, SourceFacts, SourceLanguage, StubKind,
};
use crate::error::AnalysisError;
use tree_sitter::Node;

const LITERAL_KINDS: &[&str] = &[
    "integer_literal",
    "float_literal",
    "string_literal",
    "raw_string_literal",
    "boolean_literal",
    "char_literal",
];

const INTERIOR_MUTABILITY: &[&str] = &["Mutex", "RwLock", "RefCell", "Cell<", "Atomic", "UnsafeCell"];

pub(super) fn analyze(source: &str) -> Result<SourceFacts, AnalysisError> {
    let tree = parse(tree_sitter_rust::language(), "rust", source)?;
    let root = tree.root_node();

    let mut walker = Walker {
        source,
        facts: SourceFacts {
            language: SourceLanguage::Rust,
            line_count: source.lines().count(),
            ..SourceFacts::default()
        },
    };
    let module_doc = named_children(root).into_iter().find(|n| {
        let text = walker.text(*n);
        text.starts_with("//!") || text.starts_with("/*!") || text.starts_with("#![doc")
    });
    if let Some(doc) = module_doc {
        walker.push(Pattern::ModuleDoc, doc);
    }
    walker.block(root, &Scope::default());
    Ok(walker.facts)
}

struct Walker<'s> {
    source: &'s str,
    facts: SourceFacts,
}

/// Unwrap `expr;` to `expr`
fn inner_expression(node: Node<'_>) -> Node<'_> {
    if node.kind() == "expression_statement" {
        node.named_child(0).unwrap_or(node)
    } else {
        node
    }
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
        let node = inner_expression(node);
        if !matches!(node.kind(), "if_expression" | "if_let_expression") {
            return false;
        }
        let consequence = self.field_text(node, "consequence");
        refuses_without_confirmation(self.condition_text(node))
            && ["return", "panic!", "bail!", "exit("]
                .iter()
                .any(|exit| consequence.contains(exit))
    }

    fn condition_text(&self, node: Node<'_>) -> &'s str {
        node.child_by_field_name("condition")
            .or_else(|| node.child_by_field_name("value"))
            .map(|c| self.text(c))
            .unwrap_or("")
    }

    /// Attributes and doc comments directly above an item
    fn preamble(&self, node: Node<'_>) -> (Vec<&'s str>, Vec<&'s str>) {
        let mut attributes = Vec::new();
        let mut docs = Vec::new();
        let mut current = node.prev_sibling();
        while let Some(sibling) = current {
            match sibling.kind() {
                "attribute_item" => attributes.push(self.text(sibling)),
                "line_comment" | "block_comment" => {
                    let text = self.text(sibling);
                    if text.starts_with("///") || text.starts_with("/**") {
                        docs.push(text);
                    } else {
                        break;
                    }
                }
                _ => break,
            }
            current = sibling.prev_sibling();
        }
        docs.reverse();
        (attributes, docs)
    }

    fn visit(&mut self, node: Node<'_>, scope: &Scope) {
        match node.kind() {
            "block" | "declaration_list" => self.block(node, scope),
            "function_item" => self.function(node, scope),
            "mod_item" => self.module(node, scope),
            "if_expression" | "if_let_expression" => self.conditional(node, scope),
            "for_expression" => self.for_loop(node, scope),
            "while_expression" | "while_let_expression" | "loop_expression" => {
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
            "try_expression" => {
                self.push(Pattern::ErrorHandler, node);
                self.walk_children(node, scope);
            }
            "match_expression" => {
                if self.text(node).contains("Err(") {
                    self.push(Pattern::ErrorHandler, node);
                }
                self.walk_children(node, scope);
            }
            "call_expression" => self.call(node, scope),
            "macro_invocation" => self.macro_invocation(node, scope),
            "static_item" => self.static_item(node),
            "line_comment" | "block_comment" => {
                let text = self
                    .text(node)
                    .trim_start_matches(['/', '*', '!'])
                    .trim_end_matches(['*', '/'])
                    .trim()
                    .to_string();
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
        let condition_text = self.condition_text(node);
        if condition_text.contains("Err(") || condition_text.contains("Ok(") {
            self.push(Pattern::ErrorHandler, node);
        }
        let guarded = scope.under_condition(condition_text);
        let consequence = node.child_by_field_name("consequence");
        for child in named_children(node) {
            if Some(child) == consequence {
                self.visit(child, &guarded);
            } else {
                self.visit(child, scope);
            }
        }
    }

    fn module(&mut self, node: Node<'_>, scope: &Scope) {
        let (attributes, _) = self.preamble(node);
        let name = self.field_text(node, "name");
        let is_test_module =
            attributes.iter().any(|a| a.contains("cfg(test)")) || name == "tests";
        if is_test_module {
            self.facts.test_ranges.push(line_span(node));
        }
        let inner = Scope {
            in_test: scope.in_test || is_test_module,
            ..scope.clone()
        };
        if let Some(body) = node.child_by_field_name("body") {
            self.block(body, &inner);
        }
    }

    fn function(&mut self, node: Node<'_>, scope: &Scope) {
        let name = self.field_text(node, "name").to_string();
        let (attributes, docs) = self.preamble(node);
        let is_test = attributes
            .iter()
            .any(|a| a.contains("test]") || a.contains("::test") || a.contains("#[test"));
        let in_test_scope = scope.in_test || is_test;
        let span = line_span(node);
        if is_test {
            self.facts.test_ranges.push(span);
        }

        let params: Vec<String> = node
            .child_by_field_name("parameters")
            .map(|p| {
                named_children(p)
                    .into_iter()
                    .filter(|param| param.kind() == "parameter")
                    .map(|param| self.field_text(param, "pattern").to_string())
                    .collect()
            })
            .unwrap_or_default();

        let public = named_children(node)
            .iter()
            .any(|child| child.kind() == "visibility_modifier");
        let doc = (!docs.is_empty()).then(|| {
            docs.iter()
                .map(|line| line.trim_start_matches(['/', '*']).trim())
                .collect::<Vec<_>>()
                .join("\n")
        });
        let body = node.child_by_field_name("body");
        let stub = body.and_then(|b| self.stub_kind(b, &params));

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
                name,
                public: public && scope.function.is_none(),
                doc,
                params,
                annotated: true,
                stub,
                abstract_like: false,
                handles_errors,
                deprecated: attributes.iter().any(|a| a.contains("deprecated")),
                line_count: span.1 - span.0 + 1,
                in_test_scope,
            }),
            node,
        );
    }

    fn stub_kind(&self, body: Node<'_>, params: &[String]) -> Option<StubKind> {
        let statements: Vec<Node<'_>> = named_children(body)
            .into_iter()
            .filter(|n| !n.kind().ends_with("comment"))
            .map(inner_expression)
            .collect();
        match statements.as_slice() {
            [] if !params.is_empty() => Some(StubKind::EmptyBody),
            [only] if only.kind() == "macro_invocation" => {
                let name = self.field_text(*only, "macro");
                match name {
                    "todo" | "unimplemented" => Some(StubKind::TodoMacro),
                    "panic" if self.text(*only).to_lowercase().contains("not implemented") => {
                        Some(StubKind::NotImplemented)
                    }
                    _ => None,
                }
            }
            [only] if LITERAL_KINDS.contains(&only.kind()) && !params.is_empty() => {
                Some(StubKind::ConstantReturn)
            }
            _ => None,
        }
    }

    fn for_loop(&mut self, node: Node<'_>, scope: &Scope) {
        let iterable = collapse(self.field_text(node, "value"));
        let iterable = iterable
            .trim_start_matches('&')
            .trim_start_matches("mut ")
            .trim_end_matches(".iter()")
            .to_string();
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
        let function = node.child_by_field_name("function");
        let callee = function.map(|f| collapse(self.text(f))).unwrap_or_default();
        if let Some(method) = function
            .filter(|f| f.kind() == "field_expression")
            .map(|f| self.field_text(f, "field"))
            .filter(|field| matches!(*field, "unwrap" | "expect"))
        {
            self.push(
                Pattern::Unwrap {
                    method: method.to_string(),
                    in_test_scope: scope.in_test,
                },
                node,
            );
        }

        let arguments = node.child_by_field_name("arguments");
        let string_args = arguments
            .map(|args| {
                named_children(args)
                    .into_iter()
                    .filter(|a| matches!(a.kind(), "string_literal" | "raw_string_literal"))
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

    fn macro_invocation(&mut self, node: Node<'_>, scope: &Scope) {
        let name = self.field_text(node, "macro");
        if matches!(name, "panic" | "unreachable") {
            let message = named_children(node)
                .into_iter()
                .find(|n| n.kind() == "token_tree")
                .and_then(|tree| {
                    named_children(tree)
                        .into_iter()
                        .find(|t| t.kind() == "string_literal")
                })
                .map(|literal| unquote(self.text(literal)));
            self.push(
                Pattern::Raise {
                    exception: name.to_string(),
                    literal: message.is_some(),
                    message,
                },
                node,
            );
        }
        self.walk_children(node, scope);
    }

    fn static_item(&mut self, node: Node<'_>) {
        let name = self.field_text(node, "name").to_string();
        let mutable = named_children(node)
            .iter()
            .any(|child| child.kind() == "mutable_specifier");
        let ty = self.field_text(node, "type");
        let kind = if mutable {
            Some(GlobalKind::StaticMut)
        } else if INTERIOR_MUTABILITY.iter().any(|m| ty.contains(m)) {
            Some(GlobalKind::SyncStatic)
        } else {
            None
        };
        if let Some(kind) = kind {
            self.push(Pattern::MutableGlobal { name, kind }, node);
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
    fn test_todo_macro_is_stub() {
        let facts = facts("pub fn compute(x: u32) -> u32 {\n    todo!()\n}\n");
        let (function, _) = facts.functions().next().unwrap();
        assert_eq!(function.stub, Some(StubKind::TodoMacro));
        assert!(function.public);
        assert!(!function.is_documented());
    }

    #[test]
    fn test_doc_comments_and_visibility() {
        let facts = facts(
            "/// Doubles a value.\n///\n/// # Returns\n/// twice the input\npub fn double(x: u32) -> u32 {\n    x * 2\n}\n\nfn helper() {}\n",
        );
        let double = facts.function_named("double").unwrap();
        assert!(double.is_documented());
        assert!(double.doc.as_deref().unwrap().contains("# Returns"));
        let helper = facts.function_named("helper").unwrap();
        assert!(!helper.public);
        assert_eq!(helper.stub, None);
    }

    #[test]
    fn test_tests_module_and_unwraps() {
        let facts = facts(
            "fn parse(s: &str) -> u32 {\n    s.parse().unwrap()\n}\n\n#[cfg(test)]\nmod tests {\n    #[test]\n    fn parses() {\n        assert_eq!(super::parse(\"1\"), 1);\n        \"2\".parse::<u32>().unwrap();\n    }\n}\n",
        );
        assert!(facts.has_tests());
        let unwraps: Vec<bool> = facts
            .matching(|p| matches!(p, Pattern::Unwrap { .. }))
            .filter_map(|f| match f.pattern {
                Pattern::Unwrap { in_test_scope, .. } => Some(in_test_scope),
                _ => None,
            })
            .collect();
        assert_eq!(unwraps, vec![false, true]);
    }

    #[test]
    fn test_static_mut_and_error_handling() {
        let facts = facts(
            "static mut COUNTER: u32 = 0;\n\nfn read(path: &str) -> std::io::Result<String> {\n    let text = std::fs::read_to_string(path)?;\n    Ok(text)\n}\n",
        );
        assert!(facts.has(|p| matches!(
            p,
            Pattern::MutableGlobal {
                kind: GlobalKind::StaticMut,
                ..
            }
        )));
        assert!(facts.function_named("read").unwrap().handles_errors);
    }

    #[test]
    fn test_guarded_remove_dir_all() {
        let facts = facts(
            "fn wipe(dir: &std::path::Path, confirmed: bool) {\n    if confirmed {\n        std::fs::remove_dir_all(dir).ok();\n    }\n}\n",
        );
        let call = facts
            .calls()
            .find(|(c, _)| c.callee == "std::fs::remove_dir_all")
            .unwrap()
            .0;
        assert!(call.guarded);
    }
}
