//! Parsing for the replicated command stream. Built-in parsers cover just
//! enough of the surface to drive offset tracking and `SELECT`/`REPLCONF
//! GETACK` correctly; anything else is tolerated as an opaque
//! [`crate::event::CommandEvent`] rather than rejected.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{ReplicationError, Result};

/// A parsed command ready to be folded into session state or forwarded as
/// an event. `name` is upper-cased for case-insensitive matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub name: String,
    pub args: Vec<Bytes>,
}

/// Extension point mirroring `registerCommandParser`: a parser recognizes
/// one or more command names and may rewrite/validate their argument list
/// before it reaches the event bus.
pub trait CommandParser: Send + Sync {
    fn command_names(&self) -> &[&str];
    fn parse(&self, args: &[Bytes]) -> Result<ParsedCommand>;
}

#[derive(Clone)]
struct DefaultParser;

impl CommandParser for DefaultParser {
    fn command_names(&self) -> &[&str] {
        &[]
    }

    fn parse(&self, args: &[Bytes]) -> Result<ParsedCommand> {
        let name = args
            .first()
            .ok_or_else(|| ReplicationError::protocol(anyhow::anyhow!("empty command array")))?;
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();
        Ok(ParsedCommand {
            name,
            args: args[1..].to_vec(),
        })
    }
}

/// Dispatches raw command arrays (already decoded off the wire as a RESP
/// array of bulk strings) to whichever [`CommandParser`] claims the
/// command name, falling back to [`DefaultParser`] for anything
/// unregistered.
#[derive(Clone)]
pub struct CommandRegistry {
    parsers: HashMap<String, Arc<dyn CommandParser>>,
    default: DefaultParser,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            parsers: HashMap::new(),
            default: DefaultParser,
        }
    }

    pub fn register(&mut self, parser: Arc<dyn CommandParser>) {
        for name in parser.command_names() {
            self.parsers.insert(name.to_ascii_uppercase(), parser.clone());
        }
    }

    pub fn parse(&self, args: &[Bytes]) -> Result<ParsedCommand> {
        let name = args
            .first()
            .ok_or_else(|| ReplicationError::protocol(anyhow::anyhow!("empty command array")))?;
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();

        match self.parsers.get(&name) {
            Some(parser) => parser.parse(args),
            None => self.default.parse(args),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_parser_uppercases_command_name() {
        let registry = CommandRegistry::new();
        let args = vec![Bytes::from_static(b"set"), Bytes::from_static(b"k"), Bytes::from_static(b"v")];
        let parsed = registry.parse(&args).unwrap();
        assert_eq!(parsed.name, "SET");
        assert_eq!(parsed.args, vec![Bytes::from_static(b"k"), Bytes::from_static(b"v")]);
    }

    #[test]
    fn rejects_empty_command() {
        let registry = CommandRegistry::new();
        assert!(registry.parse(&[]).is_err());
    }
}
