//! Routing of DCC chat traffic to registered handlers.
//!
//! Two tables, filled during setup and frozen once the dispatcher is handed
//! to a [`DccManager`](crate::dcc::manager::DccManager):
//!
//! - line handlers, `(regex, direction) → handler`, run for every line a
//!   session receives (`In`) or sends (`Out`). Every matching handler fires.
//! - commands, `(name, trigger regex) → handler`, run for inbound chat
//!   lines carrying the command framing (`\x01ACTION syn\x01` by default).

use std::fmt;
use std::sync::Arc;

use regex::{Captures, Regex};

use crate::dcc::session::SessionHandle;

/// Direction of a line relative to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoType {
    In,
    Out,
}

/// A line that matched a handler's pattern.
pub struct LineEvent<'a> {
    pub mask: &'a str,
    pub session: &'a SessionHandle,
    pub iotype: IoType,
    pub line: &'a str,
    captures: Captures<'a>,
}

impl<'a> LineEvent<'a> {
    /// Named capture group from the handler's pattern.
    pub fn group(&self, name: &str) -> Option<&'a str> {
        self.captures.name(name).map(|m| m.as_str())
    }
}

/// A chat line recognised as a command.
pub struct CommandEvent<'a> {
    pub mask: &'a str,
    pub session: &'a SessionHandle,
    pub name: &'a str,
    /// Whitespace-separated words after the command name.
    pub args: Vec<&'a str>,
    captures: Captures<'a>,
}

impl<'a> CommandEvent<'a> {
    pub fn group(&self, name: &str) -> Option<&'a str> {
        self.captures.name(name).map(|m| m.as_str())
    }
}

type LineFn = Arc<dyn Fn(&LineEvent<'_>) + Send + Sync>;
type CommandFn = Arc<dyn Fn(&CommandEvent<'_>) + Send + Sync>;

#[derive(Clone)]
struct LineHandler {
    pattern: Regex,
    iotype: IoType,
    handler: LineFn,
}

#[derive(Clone)]
struct Command {
    name: String,
    trigger: Regex,
    handler: CommandFn,
}

#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: Vec<LineHandler>,
    commands: Vec<Command>,
    prefix: String,
    suffix: String,
    help: bool,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.handlers.len())
            .field("commands", &self.command_names())
            .field("prefix", &self.prefix)
            .field("suffix", &self.suffix)
            .finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `help` with the list of registered commands.
    pub fn with_help(mut self) -> Self {
        self.help = true;
        self
    }

    /// Framing that marks a chat line as a command. An empty prefix makes
    /// every inbound line a command candidate.
    pub fn set_command_framing(&mut self, prefix: &str, suffix: &str) {
        self.prefix = prefix.to_string();
        self.suffix = suffix.to_string();
    }

    pub fn register_line_handler<F>(
        &mut self,
        pattern: &str,
        iotype: IoType,
        handler: F,
    ) -> Result<(), regex::Error>
    where
        F: Fn(&LineEvent<'_>) + Send + Sync + 'static,
    {
        self.handlers.push(LineHandler {
            pattern: Regex::new(pattern)?,
            iotype,
            handler: Arc::new(handler),
        });
        Ok(())
    }

    /// Register `name`, triggered by the name as the first word of the line.
    pub fn register_command<F>(&mut self, name: &str, handler: F) -> Result<(), regex::Error>
    where
        F: Fn(&CommandEvent<'_>) + Send + Sync + 'static,
    {
        let pattern = format!(r"^{}(?:\s+(?P<args>.*))?$", regex::escape(name));
        self.register_command_pattern(name, &pattern, handler)
    }

    /// Register `name` with a custom trigger pattern.
    pub fn register_command_pattern<F>(
        &mut self,
        name: &str,
        pattern: &str,
        handler: F,
    ) -> Result<(), regex::Error>
    where
        F: Fn(&CommandEvent<'_>) + Send + Sync + 'static,
    {
        self.commands.push(Command {
            name: name.to_string(),
            trigger: Regex::new(pattern)?,
            handler: Arc::new(handler),
        });
        Ok(())
    }

    pub fn command_names(&self) -> Vec<&str> {
        self.commands.iter().map(|c| c.name.as_str()).collect()
    }

    /// Run every line handler registered for `iotype` whose pattern matches.
    /// Returns how many fired.
    pub fn dispatch_line(
        &self,
        iotype: IoType,
        mask: &str,
        session: &SessionHandle,
        line: &str,
    ) -> usize {
        let mut fired = 0;
        for entry in self.handlers.iter().filter(|h| h.iotype == iotype) {
            if let Some(captures) = entry.pattern.captures(line) {
                (entry.handler)(&LineEvent {
                    mask,
                    session,
                    iotype,
                    line,
                    captures,
                });
                fired += 1;
            }
        }
        fired
    }

    /// Run the first command whose trigger matches `line` once the command
    /// framing is stripped. Returns whether a command ran.
    pub fn dispatch_command(&self, mask: &str, session: &SessionHandle, line: &str) -> bool {
        let Some(text) = self.strip_framing(line) else {
            return false;
        };

        for command in &self.commands {
            if let Some(captures) = command.trigger.captures(text) {
                (command.handler)(&CommandEvent {
                    mask,
                    session,
                    name: &command.name,
                    args: text.split_whitespace().skip(1).collect(),
                    captures,
                });
                return true;
            }
        }

        if self.help && text == "help" {
            let names = self.command_names();
            let reply = if names.is_empty() {
                "No commands available.".to_string()
            } else {
                format!("Available commands: {}", names.join(", "))
            };
            if let Err(e) = session.send_line(reply) {
                tracing::debug!(%mask, error = %e, "help reply dropped");
            }
            return true;
        }
        false
    }

    fn strip_framing<'l>(&self, line: &'l str) -> Option<&'l str> {
        let text = line.strip_prefix(self.prefix.as_str())?;
        let text = if self.suffix.is_empty() {
            text
        } else {
            text.strip_suffix(self.suffix.as_str()).unwrap_or(text)
        };
        let text = text.trim();
        (!text.is_empty()).then_some(text)
    }
}
