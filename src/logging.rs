use log::Level;

const TARGET: &str = "trex_materialize";

/// Parse a level name the way `TREX_LOG_LEVEL` is written (`warn`, `WARNING`, `4`).
pub fn parse_level(s: &str) -> log::LevelFilter {
    if let Ok(n) = s.trim().parse::<u8>() {
        return match n {
            0 => log::LevelFilter::Off,
            1 => log::LevelFilter::Error,
            2 => log::LevelFilter::Warn,
            3 => log::LevelFilter::Info,
            4 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        };
    }
    match s.trim().to_uppercase().as_str() {
        "OFF" => log::LevelFilter::Off,
        "ERROR" => log::LevelFilter::Error,
        "WARN" | "WARNING" => log::LevelFilter::Warn,
        "DEBUG" => log::LevelFilter::Debug,
        "TRACE" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    }
}

/// Logger handed to every component at construction.
///
/// A root logger only carries a category; `scoped` attaches the model being
/// executed so every record of one materialization can be grepped together.
#[derive(Debug, Clone)]
pub struct Logger {
    category: &'static str,
    model: Option<String>,
}

impl Logger {
    pub fn new(category: &'static str) -> Self {
        Self {
            category,
            model: None,
        }
    }

    pub fn scoped(&self, model: &str) -> Self {
        Self {
            category: self.category,
            model: Some(model.to_string()),
        }
    }

    pub fn with_category(&self, category: &'static str) -> Self {
        Self {
            category,
            model: self.model.clone(),
        }
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn log(&self, level: Level, message: &str) {
        match &self.model {
            Some(model) => log::log!(
                target: TARGET,
                level,
                "[{}] [model={}] {}",
                self.category,
                model,
                message
            ),
            None => log::log!(target: TARGET, level, "[{}] {}", self.category, message),
        }
    }

    pub fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(Level::Warn, message);
    }

    pub fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(Level::Debug, message);
    }
}

impl Default for Logger {
    fn default() -> Self {
        Logger::new("materialize")
    }
}
