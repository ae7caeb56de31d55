//! TypeScript / JavaScript syntax walker

use super::patterns::refuses_without_confirmation;
use super::{
    collapse, line_span, location, named_children, parse, text, unquote, CallFact, FunctionFact,
    GlobalKind, LoopFact, Pattern, Scope, SourceFacts, SourceLanguage, StubKind,
};
use crate::error::AnalysisError;
use tree_sitter::Node;

const TEST_CALLEES: &[&str] = &["it", "test", "it.only", "test.only", "it.each", "test.each"];
const SUITE_CALLEES: &[&str] = &["describe", "describe.only", "suite"];
const LITERAL_KINDS: &[&str] = &["string", "template_string", "number", "true", "false", "null"];

pub(super) fn analyze(source: &str) -> Result<SourceFacts, AnalysisError> {
    let tree = parse(tree_sitter_typescript::language_typescript(), "typescript", source)?;
    let root = tree.root_node();

    let mut walker = Walker {
        source,
        facts: SourceFacts {
            language: SourceLanguage::TypeScript,
            line_count: source.lines().count(),
            ..SourceFacts::default()
        },
    };
    if let Some(first) = root.named_child(0).filter(|n| n.kind() == "comment") {
        if walker.is_module_doc(first) {
            walker.push(Pattern::ModuleDoc, first);
        }
    }
    let scope = Scope::default();
    for child in named_children(root) {
        walker.top_level(child, &scope);
    }
    Ok(walker.facts)
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

    fn is_module_doc(&self, comment: Node<'_>) -> bool {
        let text = self.text(comment);
        if ["@module", "@file", "@fileoverview"].iter().any(|tag| text.contains(tag)) {
            return true;
        }
        let documents_item = comment.next_named_sibling().map_or(false, |next| {
            matches!(
                next.kind(),
                "function_declaration" | "class_declaration" | "export_statement" | "lexical_declaration"
            ) && next.start_position().row <= comment.end_position().row + 1
        });
        text.starts_with("/**") && !documents_item
    }

    /// JSDoc block directly above a declaration or its export wrapper
    fn jsdoc(&self, node: Node<'_>) -> Option<String> {
        let anchor = match node.parent() {
            Some(parent) if parent.kind() == "export_statement" => parent,
            _ => node,
        };
        anchor
            .prev_named_sibling()
            .filter(|sibling| sibling.kind() == "comment")
            .map(|sibling| self.text(sibling))
            .filter(|text| text.starts_with("/**"))
            .map(|text| {
                text.trim_start_matches("/**")
                    .trim_end_matches("*/")
                    .lines()
                    .map(|line| line.trim().trim_start_matches('*').trim())
                    .filter(|line| !line.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
    }

    fn top_level(&mut self, node: Node<'_>, scope: &Scope) {
        let declaration = match node.kind() {
            "export_statement" => node.child_by_field_name("declaration"),
            _ => Some(node),
        };
        if let Some(declaration) = declaration {
            if self.is_mutable_binding(declaration) {
                for declarator in named_children(declaration)
                    .into_iter()
                    .filter(|d| d.kind() == "variable_declarator")
                {
                    let literal = declarator
                        .child_by_field_name("value")
                        .map_or(false, |v| matches!(v.kind(), "array" | "object"));
                    if literal {
                        let name = self.field_text(declarator, "name").to_string();
                        self.push(
                            Pattern::MutableGlobal {
                                name,
                                kind: GlobalKind::MutableLiteral,
                            },
                            declarator,
                        );
                    }
                }
            }
        }
        self.visit(node, scope);
    }

    fn is_mutable_binding(&self, node: Node<'_>) -> bool {
        match node.kind() {
            "variable_declaration" => true,
            "lexical_declaration" => self.text(node).trim_start().starts_with("let"),
            _ => false,
        }
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
        if node.kind() != "if_statement" {
            return false;
        }
        let consequence = self.field_text(node, "consequence");
        refuses_without_confirmation(self.field_text(node, "condition"))
            && ["return", "throw", "process.exit"]
                .iter()
                .any(|exit| consequence.contains(exit))
    }

    fn visit(&mut self, node: Node<'_>, scope: &Scope) {
        match node.kind() {
            "statement_block" | "class_body" => self.block(node, scope),
            "function_declaration" | "generator_function_declaration" | "method_definition" => {
                let name = self.field_text(node, "name").to_string();
                self.function(node, name, scope)
            }
            "variable_declarator" => {
                let value = node
                    .child_by_field_name("value")
                    .filter(|v| matches!(v.kind(), "arrow_function" | "function" | "function_expression"));
                match value {
                    Some(function) => {
                        let name = self.field_text(node, "name").to_string();
                        self.function(function, name, scope)
                    }
                    None => self.walk_children(node, scope),
                }
            }
            "abstract_class_declaration" => {
                let inner = Scope {
                    abstract_class: true,
                    ..scope.clone()
                };
                self.walk_children(node, &inner);
            }
            "try_statement" => self.try_statement(node, scope),
            "throw_statement" => self.throw(node, scope),
            "if_statement" => self.conditional(node, scope),
            "for_in_statement" => self.for_loop(node, scope),
            "for_statement" | "while_statement" | "do_statement" => {
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
            "call_expression" => self.call(node, scope),
            "comment" => {
                let text = self
                    .text(node)
                    .trim_start_matches(['/', '*'])
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
        let guarded = scope.under_condition(self.field_text(node, "condition"));
        let consequence = node.child_by_field_name("consequence");
        for child in named_children(node) {
            if Some(child) == consequence {
                self.visit(child, &guarded);
            } else {
                self.visit(child, scope);
            }
        }
    }

    fn function(&mut self, node: Node<'_>, name: String, scope: &Scope) {
        let span = line_span(node);
        let (params, all_typed) = node
            .child_by_field_name("parameters")
            .map(|p| self.parameters(p))
            .or_else(|| {
                node.child_by_field_name("parameter")
                    .map(|p| (vec![self.text(p).to_string()], false))
            })
            .unwrap_or((Vec::new(), true));
        let returns_typed = node.child_by_field_name("return_type").is_some()
            || name == "constructor";

        let private = node.kind() == "method_definition"
            && (name.starts_with('#')
                || name.starts_with('_')
                || named_children(node).iter().any(|child| {
                    child.kind() == "accessibility_modifier" && self.text(*child) != "public"
                }));
        let exported = node
            .parent()
            .map_or(false, |p| p.kind() == "export_statement")
            || node
                .parent()
                .and_then(|declarator| declarator.parent())
                .and_then(|declaration| declaration.parent())
                .map_or(false, |p| p.kind() == "export_statement");
        let public = scope.function.is_none()
            && ((node.kind() == "method_definition" && !private) || exported);

        let doc = self.jsdoc(match node.kind() {
            "arrow_function" | "function" | "function_expression" => node
                .parent()
                .and_then(|declarator| declarator.parent())
                .unwrap_or(node),
            _ => node,
        });
        let body = node
            .child_by_field_name("body")
            .filter(|b| b.kind() == "statement_block");
        let stub = body.and_then(|b| self.stub_kind(b, &params));

        let before = self.facts.findings.len();
        if let Some(body) = node.child_by_field_name("body") {
            let inner = Scope {
                in_test: scope.in_test,
                in_try: false,
                guarded: scope.guarded,
                function: Some(name.clone()),
                loop_iterables: Vec::new(),
                abstract_class: false,
                depth: scope.depth + 1,
            };
            self.visit(body, &inner);
        }
        let handles_errors = self.facts.findings[before..]
            .iter()
            .any(|f| matches!(f.pattern, Pattern::ErrorHandler));
        let deprecated = doc.as_deref().map_or(false, |d| d.contains("@deprecated"));

        self.push(
            Pattern::Function(FunctionFact {
                name,
                public,
                doc,
                params,
                annotated: all_typed && returns_typed,
                stub,
                abstract_like: scope.abstract_class,
                handles_errors,
                deprecated,
                line_count: span.1 - span.0 + 1,
                in_test_scope: scope.in_test,
            }),
            node,
        );
    }

    fn parameters(&self, node: Node<'_>) -> (Vec<String>, bool) {
        let mut all_typed = true;
        let params = named_children(node)
            .into_iter()
            .filter(|p| matches!(p.kind(), "required_parameter" | "optional_parameter"))
            .map(|p| {
                all_typed &= p.child_by_field_name("type").is_some();
                self.field_text(p, "pattern").to_string()
            })
            .collect();
        (params, all_typed)
    }

    fn stub_kind(&self, body: Node<'_>, params: &[String]) -> Option<StubKind> {
        let statements: Vec<Node<'_>> = named_children(body)
            .into_iter()
            .filter(|n| n.kind() != "comment")
            .collect();
        match statements.as_slice() {
            [] if !params.is_empty() => Some(StubKind::EmptyBody),
            [only] if only.kind() == "throw_statement"
                && self.text(*only).to_lowercase().contains("not implemented") =>
            {
                Some(StubKind::NotImplemented)
            }
            [only] if only.kind() == "return_statement" && !params.is_empty() => only
                .named_child(0)
                .filter(|value| LITERAL_KINDS.contains(&value.kind()))
                .map(|_| StubKind::ConstantReturn),
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
                continue;
            }
            if child.kind() == "catch_clause" {
                let empty = child.child_by_field_name("body").map_or(true, |b| {
                    named_children(b).iter().all(|s| s.kind() == "comment")
                });
                if empty {
                    self.push(Pattern::SwallowedError, child);
                }
            }
            self.visit(child, scope);
        }
    }

    fn throw(&mut self, node: Node<'_>, scope: &Scope) {
        if let Some(thrown) = node
            .named_child(0)
            .filter(|n| matches!(n.kind(), "new_expression" | "call_expression"))
        {
            let (constructor_field, arguments) = if thrown.kind() == "new_expression" {
                ("constructor", thrown.child_by_field_name("arguments"))
            } else {
                ("function", thrown.child_by_field_name("arguments"))
            };
            let exception = self.field_text(thrown, constructor_field).to_string();
            let first = arguments.and_then(|args| args.named_child(0));
            let literal = first.map_or(false, |a| matches!(a.kind(), "string" | "template_string"));
            let message = first.map(|a| unquote(self.text(a)));
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
        let string_args: Vec<String> = arguments
            .map(|args| {
                named_children(args)
                    .into_iter()
                    .filter(|a| matches!(a.kind(), "string" | "template_string"))
                    .map(|a| unquote(self.text(a)))
                    .collect()
            })
            .unwrap_or_default();

        if callee.ends_with(".catch") {
            self.push(Pattern::ErrorHandler, node);
        }

        let is_test = TEST_CALLEES.contains(&callee.as_str());
        let is_suite = SUITE_CALLEES.contains(&callee.as_str());
        if is_test || is_suite {
            self.facts.test_ranges.push(line_span(node));
            if is_test {
                let name = string_args.first().cloned().unwrap_or_default();
                self.push(Pattern::TestFunction { name }, node);
            }
            let inner = Scope {
                in_test: true,
                ..scope.clone()
            };
            self.walk_children(node, &inner);
            return;
        }

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
}
