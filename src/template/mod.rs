//! Variable substitution and prompt assembly.
//!
//! Templates use shell-flavored placeholders: `$1`..`$n` positionals,
//! `$ARGUMENTS` for the whole argument list, `$CONTEXT` (with
//! `$EXTERNAL_CONTEXT` and `$ISSUE_CONTEXT` aliases) for platform metadata,
//! and `\$` for a literal dollar. Unknown `$NAME` placeholders are left
//! untouched so shell snippets inside command files survive substitution.

use std::collections::HashMap;

/// Separator between the substituted template and the appended context.
const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// Aliases that all expand to the external-context string.
const CONTEXT_ALIASES: [&str; 3] = ["CONTEXT", "EXTERNAL_CONTEXT", "ISSUE_CONTEXT"];

/// Inputs to one substitution pass.
#[derive(Debug, Default, Clone)]
pub struct PromptContext {
    pub positional: Vec<String>,
    pub named: HashMap<String, String>,
    pub external_context: Option<String>,
}

impl PromptContext {
    pub fn new(positional: Vec<String>) -> Self {
        Self {
            positional,
            ..Default::default()
        }
    }

    pub fn with_named(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.named.insert(name.into(), value.into());
        self
    }

    pub fn with_external_context(mut self, context: Option<String>) -> Self {
        self.external_context = context;
        self
    }
}

/// Expand placeholders in `template`. Does not append the external context;
/// see [`assemble_prompt`] for the full assembly.
pub fn substitute(template: &str, ctx: &PromptContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        match c {
            '\\' if matches!(chars.peek(), Some((_, '$'))) => {
                chars.next();
                out.push('$');
            }
            '$' => {
                let name: String = {
                    let mut name = String::new();
                    if matches!(chars.peek(), Some((_, d)) if d.is_ascii_digit()) {
                        while let Some((_, d)) = chars.peek().copied() {
                            if d.is_ascii_digit() {
                                name.push(d);
                                chars.next();
                            } else {
                                break;
                            }
                        }
                    } else {
                        while let Some((_, d)) = chars.peek().copied() {
                            if d.is_ascii_alphanumeric() || d == '_' {
                                name.push(d);
                                chars.next();
                            } else {
                                break;
                            }
                        }
                    }
                    name
                };

                if name.is_empty() {
                    out.push('$');
                } else if let Ok(position) = name.parse::<usize>() {
                    // $1 is the first argument; $0 is nothing we know.
                    if position >= 1 {
                        if let Some(value) = ctx.positional.get(position - 1) {
                            out.push_str(value);
                        }
                    }
                } else if name == "ARGUMENTS" {
                    out.push_str(&ctx.positional.join(" "));
                } else if CONTEXT_ALIASES.contains(&name.as_str()) {
                    if let Some(context) = &ctx.external_context {
                        out.push_str(context);
                    }
                } else if let Some(value) = ctx.named.get(&name) {
                    out.push_str(value);
                } else {
                    // Unknown names stay literal to avoid mangling shell text.
                    out.push('$');
                    out.push_str(&name);
                }
            }
            _ => out.push(c),
        }
    }

    out
}

/// Full prompt assembly: substitution plus the unconditional external-context
/// append. The append happens even when the template already referenced
/// `$CONTEXT`; downstream prompts rely on that redundancy.
pub fn assemble_prompt(template: &str, ctx: &PromptContext) -> String {
    let mut prompt = substitute(template, ctx);
    if let Some(context) = &ctx.external_context {
        if !context.is_empty() {
            prompt.push_str(CONTEXT_SEPARATOR);
            prompt.push_str(context);
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ctx(args: &[&str]) -> PromptContext {
        PromptContext::new(args.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn positional_and_arguments() {
        let context = ctx(&["dark", "mode"]);
        assert_eq!(substitute("add $1 $2", &context), "add dark mode");
        assert_eq!(substitute("all: $ARGUMENTS", &context), "all: dark mode");
    }

    #[test]
    fn missing_positionals_expand_empty() {
        let context = ctx(&["one"]);
        assert_eq!(substitute("[$1][$2][$3]", &context), "[one][][]");
    }

    #[test]
    fn context_aliases_all_expand() {
        let context = ctx(&[]).with_external_context(Some("issue body".to_string()));
        for alias in ["$CONTEXT", "$EXTERNAL_CONTEXT", "$ISSUE_CONTEXT"] {
            assert_eq!(substitute(alias, &context), "issue body");
        }
    }

    #[test]
    fn escaped_dollar_is_literal_and_stable() {
        let context = ctx(&["x"]);
        assert_eq!(substitute(r"price: \$5", &context), "price: $5");
        // Fixed point: a second pass does not re-expand.
        let once = substitute(r"\$UNKNOWN and $1", &context);
        assert_eq!(once, "$UNKNOWN and x");
        assert_eq!(substitute(&once, &context), once);
    }

    #[test]
    fn unknown_names_left_as_is() {
        let context = ctx(&[]);
        assert_eq!(substitute("echo $HOME/$PATH", &context), "echo $HOME/$PATH");
    }

    #[test]
    fn named_bindings_expand() {
        let context = ctx(&[]).with_named("USER_MESSAGE", "fix the bug");
        assert_eq!(substitute("msg: $USER_MESSAGE", &context), "msg: fix the bug");
    }

    #[test]
    fn external_context_appended_unconditionally() {
        let context = ctx(&[]).with_external_context(Some("labels: bug".to_string()));
        let prompt = assemble_prompt("use $CONTEXT", &context);
        assert_eq!(prompt, "use labels: bug\n\n---\n\nlabels: bug");

        // No context: no separator.
        let bare = ctx(&[]);
        assert_eq!(assemble_prompt("plain", &bare), "plain");
    }

    #[test]
    fn substitution_is_idempotent_for_plain_templates() {
        let context = ctx(&["a", "b"]).with_named("NAME", "value");
        let template = "do $1 then $2 with $NAME and $ARGUMENTS";
        let once = substitute(template, &context);
        assert_eq!(substitute(&once, &context), once);
    }
}
