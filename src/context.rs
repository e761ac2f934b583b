//! Replay context: the state every component of one replay shares

use crate::logging::ReplayLogger;
use crate::options::ReplayOptions;
use crate::statistics::Statistics;
use crate::types::Verbosity;

/// Options, logger and statistics for one replay run.
///
/// Created once per run and threaded through the dispatcher and the
/// scheduled action runner; nothing here is global.
#[derive(Debug, Clone)]
pub struct ReplayContext {
    options: ReplayOptions,
    pub logger: ReplayLogger,
    pub statistics: Statistics,
}

impl ReplayContext {
    pub fn new(options: ReplayOptions) -> Self {
        let logger = ReplayLogger::new(options.verbosity, options.max_printed_warnings);
        Self {
            options,
            logger,
            statistics: Statistics::new(),
        }
    }

    pub fn options(&self) -> &ReplayOptions {
        &self.options
    }

    pub fn verbosity(&self) -> Verbosity {
        self.options.verbosity
    }

    /// Whether recorded user data and names reach the live API
    pub fn forwards_user_data(&self) -> bool {
        self.options.user_data
    }

    pub fn logger(&self) -> &ReplayLogger {
        &self.logger
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }
}

impl Default for ReplayContext {
    fn default() -> Self {
        Self::new(ReplayOptions::default())
    }
}
