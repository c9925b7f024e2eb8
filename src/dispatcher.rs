//! `CommandDispatcher` — tokenise a command string, resolve it to either a
//! built-in shell command or a `module.action` call, coerce its arguments,
//! and invoke it.

use std::sync::Arc;

use serde_json::Value;

use crate::config::Config;
use crate::error::AgentError;
use crate::generator::{GenerateOptions, TextGenerator};
use crate::module::{CallArgs, ModuleManager};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("parse error: {0}")]
    ParseError(String),
    #[error("unknown module: {name}")]
    UnknownModule { name: String, suggestion: Option<String> },
}

/// The finite set of commands the external shell surface recognizes
/// without a dot. Anything undotted outside this set is not a built-in —
/// it's unrecognized and falls through to the suggestion/NL-fallback path
/// just like an unknown module would.
const BUILTIN_COMMANDS: &[&str] = &[
    "help", "status", "evolve", "reload", "history", "clear", "exit", "quit", "bye", "/exit",
    "/quit", "/bye", "modules", "config", "generate", "analyze", "monitor",
];

fn is_builtin(token: &str) -> bool {
    BUILTIN_COMMANDS.contains(&token)
}

/// Outcome of classifying a command's head token.
enum Head {
    /// `module.action`, the module and action names already split.
    ModuleAction(String, String),
    /// No dot, and a literal match against [`BUILTIN_COMMANDS`]: delegated
    /// to the external shell surface. The dispatcher does not run these
    /// itself.
    BuiltIn(String),
    /// Neither a dotted `module.action` nor a known built-in — treated the
    /// same as an unknown module: suggestion first, then NL fallback.
    Unrecognized(String),
}

fn classify_head(token: &str) -> Head {
    match token.split_once('.') {
        Some((module, action)) if !module.is_empty() && !action.is_empty() => {
            Head::ModuleAction(module.to_string(), action.to_string())
        }
        _ if is_builtin(token) => Head::BuiltIn(token.to_string()),
        _ => Head::Unrecognized(token.to_string()),
    }
}

/// Coerces a scalar token: case-insensitive
/// `true/false/none/null`, then integer, then float, else the original
/// string.
fn coerce_scalar(token: &str) -> Value {
    match token.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "none" | "null" => return Value::Null,
        _ => {}
    }
    if let Ok(i) = token.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = token.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::from(token)
}

fn flag_name(raw: &str) -> String {
    raw.trim_start_matches("--").replace('-', "_")
}

/// Splits the remaining tokens (after the head) into positional values and
/// keyword arguments.
fn parse_args(tokens: &[String]) -> CallArgs {
    let mut args = CallArgs::new();
    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];
        if let Some(rest) = token.strip_prefix("--") {
            if let Some((name, value)) = rest.split_once('=') {
                args.kwargs.insert(flag_name(name), coerce_scalar(value));
                i += 1;
                continue;
            }
            let name = flag_name(rest);
            let next_is_value = tokens
                .get(i + 1)
                .map(|t| !t.starts_with("--"))
                .unwrap_or(false);
            if next_is_value {
                args.kwargs.insert(name, coerce_scalar(&tokens[i + 1]));
                i += 2;
            } else {
                args.kwargs.insert(name, Value::Bool(true));
                i += 1;
            }
        } else {
            args.positional.push(coerce_scalar(token));
            i += 1;
        }
    }
    args
}

/// Result of a single dispatch: either a built-in command line handed back
/// to the external shell surface, or a module call's return value.
pub enum Dispatched {
    BuiltIn { command: String, args: CallArgs },
    Called(Value),
}

pub struct CommandDispatcher {
    manager: Arc<ModuleManager>,
    generator: Option<Arc<dyn TextGenerator>>,
}

impl CommandDispatcher {
    pub fn new(manager: Arc<ModuleManager>, generator: Option<Arc<dyn TextGenerator>>) -> Self {
        Self { manager, generator }
    }

    /// Tokenises, classifies, and dispatches `line`. Built-in commands are
    /// returned to the caller rather than executed here.
    pub async fn dispatch(&self, line: &str, config: &Config) -> Result<Dispatched, AgentError> {
        let tokens = shell_words::split(line)
            .map_err(|e| DispatchError::ParseError(e.to_string()))?;
        let Some((head, rest)) = tokens.split_first() else {
            return Err(DispatchError::ParseError("empty command".into()).into());
        };

        match classify_head(head) {
            Head::BuiltIn(command) => Ok(Dispatched::BuiltIn {
                command,
                args: parse_args(rest),
            }),
            Head::ModuleAction(module, action) => {
                let args = parse_args(rest);
                match self.call(&module, &action, args.clone()).await {
                    Ok(value) => Ok(Dispatched::Called(value)),
                    Err(AgentError::ModuleNotFound(name)) => {
                        self.fallback_or_unknown_module(line, &name, config).await
                    }
                    Err(other) => Err(other),
                }
            }
            Head::Unrecognized(name) => self.fallback_or_unknown_module(line, &name, config).await,
        }
    }

    async fn call(&self, module: &str, action: &str, args: CallArgs) -> Result<Value, AgentError> {
        self.manager.call(module, action, args).await
    }

    /// When the first token lexically prefixes a known action, a
    /// suggestion takes priority over the NL fallback.
    async fn fallback_or_unknown_module(
        &self,
        line: &str,
        module: &str,
        config: &Config,
    ) -> Result<Dispatched, AgentError> {
        let known_actions = self.known_module_actions().await;

        if let Some(suggestion) = known_actions
            .iter()
            .find(|name| name.starts_with(module))
            .cloned()
        {
            return Err(DispatchError::UnknownModule {
                name: module.to_string(),
                suggestion: Some(suggestion),
            }
            .into());
        }

        let Some(generator) = self.generator.as_ref() else {
            return Err(DispatchError::UnknownModule {
                name: module.to_string(),
                suggestion: None,
            }
            .into());
        };
        if !config.shell.use_nlp {
            return Err(DispatchError::UnknownModule {
                name: module.to_string(),
                suggestion: None,
            }
            .into());
        }

        let prompt = format!(
            "Known commands: {}\n\nRewrite this request as exactly one of those commands \
             (module.action [args]), with no extra commentary:\n{}",
            known_actions.join(", "),
            line
        );
        let reply = generator
            .generate(&prompt, &GenerateOptions::default())
            .await?;
        let normalized = reply.trim();

        Box::pin(self.dispatch_once_normalized(normalized)).await
    }

    /// Dispatches an already-normalized (LLM-rewritten) command line. Does
    /// not recurse into another fallback round on failure — the rewrite
    /// gets exactly one shot.
    async fn dispatch_once_normalized(&self, line: &str) -> Result<Dispatched, AgentError> {
        let tokens = shell_words::split(line).map_err(|e| DispatchError::ParseError(e.to_string()))?;
        let Some((head, rest)) = tokens.split_first() else {
            return Err(DispatchError::ParseError("empty normalized command".into()).into());
        };
        match classify_head(head) {
            Head::BuiltIn(command) => Ok(Dispatched::BuiltIn {
                command,
                args: parse_args(rest),
            }),
            Head::ModuleAction(module, action) => {
                let value = self.call(&module, &action, parse_args(rest)).await?;
                Ok(Dispatched::Called(value))
            }
            Head::Unrecognized(name) => Err(DispatchError::UnknownModule {
                name,
                suggestion: None,
            }
            .into()),
        }
    }

    async fn known_module_actions(&self) -> Vec<String> {
        let mut names = Vec::new();
        for descriptor in self.manager.list().await {
            if let Some(module) = self.manager.get(&descriptor.name).await {
                for capability in module.capabilities() {
                    names.push(format!("{}.{}", descriptor.name, capability.name));
                }
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerces_booleans_null_and_numbers() {
        assert_eq!(coerce_scalar("TRUE"), Value::Bool(true));
        assert_eq!(coerce_scalar("False"), Value::Bool(false));
        assert_eq!(coerce_scalar("None"), Value::Null);
        assert_eq!(coerce_scalar("42"), Value::from(42));
        assert_eq!(coerce_scalar("3.5"), Value::from(3.5));
        assert_eq!(coerce_scalar("hello"), Value::from("hello"));
    }

    #[test]
    fn parses_equals_and_space_flags_and_trailing_boolean_flag() {
        let tokens: Vec<String> = ["url", "--retries=3", "--verbose"]
            .into_iter()
            .map(String::from)
            .collect();
        let args = parse_args(&tokens);
        assert_eq!(args.positional, vec![Value::from("url")]);
        assert_eq!(args.kwargs.get("retries"), Some(&Value::from(3)));
        assert_eq!(args.kwargs.get("verbose"), Some(&Value::Bool(true)));
    }

    #[test]
    fn space_separated_flag_consumes_following_token() {
        let tokens: Vec<String> = ["--name", "alice"].into_iter().map(String::from).collect();
        let args = parse_args(&tokens);
        assert_eq!(args.kwargs.get("name"), Some(&Value::from("alice")));
        assert!(args.positional.is_empty());
    }

    #[test]
    fn classifies_dotted_head_as_module_action() {
        match classify_head("net.fetch") {
            Head::ModuleAction(m, a) => {
                assert_eq!(m, "net");
                assert_eq!(a, "fetch");
            }
            Head::BuiltIn(_) | Head::Unrecognized(_) => panic!("expected module.action"),
        }
    }

    #[test]
    fn classifies_known_plain_head_as_builtin() {
        match classify_head("status") {
            Head::BuiltIn(c) => assert_eq!(c, "status"),
            Head::ModuleAction(..) | Head::Unrecognized(_) => panic!("expected builtin"),
        }
    }

    #[test]
    fn classifies_unknown_undotted_head_as_unrecognized() {
        match classify_head("please") {
            Head::Unrecognized(name) => assert_eq!(name, "please"),
            Head::BuiltIn(_) | Head::ModuleAction(..) => panic!("expected unrecognized"),
        }
    }
}
