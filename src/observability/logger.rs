//! Component loggers with numeric message ids.
//!
//! Each component owns one [`MessageLogger`]. A record is identified by
//! `SZSDK{component:04}{number:04}`; the number also fixes the severity
//! (see [`LogLevel::for_message`]).

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use super::LogLevel;
use crate::types::Result;

/// Fixed message texts of a component, keyed by message number.
pub type MessageTemplates = &'static [(u32, &'static str)];

/// Logger bound to one component id.
pub struct MessageLogger {
    component_id: u32,
    prefix: &'static str,
    templates: MessageTemplates,
    level: AtomicU8,
}

impl MessageLogger {
    pub fn new(component_id: u32, prefix: &'static str, templates: MessageTemplates) -> Self {
        Self {
            component_id,
            prefix,
            templates,
            level: AtomicU8::new(LogLevel::Info as u8),
        }
    }

    pub fn component_id(&self) -> u32 {
        self.component_id
    }

    /// Method-name prefix, e.g. `szconfigserver.`.
    pub fn prefix(&self) -> &'static str {
        self.prefix
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Change the level from a level name. Unknown names are `bad-input`.
    pub fn set_log_level(&self, name: &str) -> Result<LogLevel> {
        let level: LogLevel = name.parse()?;
        self.level.store(level as u8, Ordering::Relaxed);
        Ok(level)
    }

    pub fn is_enabled(&self, level: LogLevel) -> bool {
        level >= self.log_level()
    }

    pub fn is_trace(&self) -> bool {
        self.log_level() == LogLevel::Trace
    }

    pub fn message_id(&self, number: u32) -> String {
        format!("SZSDK{:04}{:04}", self.component_id, number)
    }

    pub fn template(&self, number: u32) -> &'static str {
        self.templates
            .iter()
            .find(|(n, _)| *n == number)
            .map(|(_, text)| *text)
            .unwrap_or("")
    }

    /// Emit message `number` with its template text and free-form details.
    pub fn log(&self, number: u32, details: impl fmt::Display) {
        self.emit(number, self.template(number), details);
    }

    /// Emit message `number` with explicit text, used for generated
    /// messages such as enter/exit traces.
    pub fn log_text(&self, number: u32, text: &str, details: impl fmt::Display) {
        self.emit(number, text, details);
    }

    fn emit(&self, number: u32, text: &str, details: impl fmt::Display) {
        let level = LogLevel::for_message(number);
        if !self.is_enabled(level) {
            return;
        }
        let id = self.message_id(number);
        match level {
            LogLevel::Trace => tracing::trace!(message_id = %id, details = %details, "{}", text),
            LogLevel::Debug => tracing::debug!(message_id = %id, details = %details, "{}", text),
            LogLevel::Info => tracing::info!(message_id = %id, details = %details, "{}", text),
            LogLevel::Warn => tracing::warn!(message_id = %id, details = %details, "{}", text),
            LogLevel::Error | LogLevel::Fatal | LogLevel::Panic => tracing::error!(
                message_id = %id,
                level_name = level.as_str(),
                details = %details,
                "{}",
                text
            ),
        }
    }
}

impl fmt::Debug for MessageLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageLogger")
            .field("component_id", &self.component_id)
            .field("prefix", &self.prefix)
            .field("level", &self.log_level())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    const TEMPLATES: MessageTemplates = &[
        (2003, "Server listening"),
        (3001, "Observer delivery failing"),
        (4001, "Listen failed"),
    ];

    #[test]
    fn test_message_id_format() {
        let logger = MessageLogger::new(6204, "grpcserver.", TEMPLATES);
        assert_eq!(logger.message_id(2003), "SZSDK62042003");
        assert_eq!(logger.message_id(7), "SZSDK62040007");
    }

    #[test]
    fn test_set_log_level() {
        let logger = MessageLogger::new(6011, "szconfigserver.", TEMPLATES);
        assert_eq!(logger.log_level(), LogLevel::Info);
        assert!(!logger.is_trace());

        logger.set_log_level("trace").unwrap();
        assert!(logger.is_trace());

        assert_eq!(logger.set_log_level("LOUD").unwrap_err().kind(), "bad-input");
        assert!(logger.is_trace());
    }

    #[traced_test]
    #[test]
    fn test_level_gates_output() {
        let logger = MessageLogger::new(6204, "grpcserver.", TEMPLATES);
        logger.set_log_level("WARN").unwrap();
        logger.log(2003, "127.0.0.1:8258");
        logger.log(4001, "address in use");

        assert!(!logs_contain("SZSDK62042003"));
        assert!(logs_contain("SZSDK62044001"));
        assert!(logs_contain("Listen failed"));
    }
}
