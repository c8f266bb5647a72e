//! Enter/exit tracing for handler calls.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use super::MessageLogger;
use crate::types::CorrelationId;

/// Guard that pairs one Enter record with exactly one Exit record.
///
/// The Enter record is written on construction, the Exit record when the
/// guard is dropped, so a call abandoned by its client still gets an Exit
/// (with outcome `cancelled`). Nothing is written unless the logger is at
/// `TRACE`.
pub struct CallTrace {
    logger: Arc<MessageLogger>,
    exit_number: u32,
    method: &'static str,
    correlation_id: CorrelationId,
    started: Instant,
    outcome: Option<String>,
    enabled: bool,
}

impl CallTrace {
    /// Write the Enter record. `enter_number` is odd; Exit uses the next number.
    pub fn enter(
        logger: Arc<MessageLogger>,
        enter_number: u32,
        method: &'static str,
        correlation_id: CorrelationId,
        request: impl fmt::Debug,
    ) -> Self {
        let enabled = logger.is_trace();
        if enabled {
            logger.log_text(
                enter_number,
                &format!("Enter {}{}", logger.prefix(), method),
                format_args!("correlation_id={} request={:?}", correlation_id, request),
            );
        }
        Self {
            logger,
            exit_number: enter_number + 1,
            method,
            correlation_id,
            started: Instant::now(),
            outcome: None,
            enabled,
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Record the call outcome; the Exit record is written when `self` drops.
    pub fn finish(mut self, outcome: impl Into<String>) {
        self.outcome = Some(outcome.into());
    }
}

impl Drop for CallTrace {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }
        let outcome = self.outcome.as_deref().unwrap_or("cancelled");
        self.logger.log_text(
            self.exit_number,
            &format!("Exit  {}{}", self.logger.prefix(), self.method),
            format_args!(
                "correlation_id={} outcome={} elapsed_us={}",
                self.correlation_id,
                outcome,
                self.started.elapsed().as_micros()
            ),
        );
    }
}

impl fmt::Debug for CallTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallTrace")
            .field("method", &self.method)
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn trace_logger() -> Arc<MessageLogger> {
        let logger = Arc::new(MessageLogger::new(6012, "szconfigmanagerserver.", &[]));
        logger.set_log_level("TRACE").unwrap();
        logger
    }

    #[traced_test]
    #[test]
    fn test_enter_and_exit_share_correlation_id() {
        let logger = trace_logger();
        let correlation_id = CorrelationId::new();
        let expected = correlation_id.to_string();

        let trace = CallTrace::enter(logger, 11, "GetDefaultConfigId", correlation_id, ());
        trace.finish("ok");

        logs_assert(|lines: &[&str]| {
            let enter: Vec<_> = lines.iter().filter(|l| l.contains("SZSDK60120011")).collect();
            let exit: Vec<_> = lines.iter().filter(|l| l.contains("SZSDK60120012")).collect();
            if enter.len() != 1 || exit.len() != 1 {
                return Err(format!("expected one enter and one exit, got {} and {}", enter.len(), exit.len()));
            }
            if !enter[0].contains(&expected) || !exit[0].contains(&expected) {
                return Err("correlation id missing".to_string());
            }
            let enter_pos = lines.iter().position(|l| l.contains("SZSDK60120011"));
            let exit_pos = lines.iter().position(|l| l.contains("SZSDK60120012"));
            if enter_pos >= exit_pos {
                return Err("exit logged before enter".to_string());
            }
            Ok(())
        });
    }

    #[traced_test]
    #[test]
    fn test_dropped_trace_reports_cancelled() {
        let logger = trace_logger();
        {
            let _trace = CallTrace::enter(logger, 1, "AddConfig", CorrelationId::new(), "request");
        }
        assert!(logs_contain("outcome=cancelled"));
    }

    #[traced_test]
    #[test]
    fn test_silent_below_trace() {
        let logger = Arc::new(MessageLogger::new(6012, "szconfigmanagerserver.", &[]));
        let trace = CallTrace::enter(logger, 1, "AddConfig", CorrelationId::new(), ());
        trace.finish("ok");
        assert!(!logs_contain("SZSDK60120001"));
        assert!(!logs_contain("SZSDK60120002"));
    }
}
