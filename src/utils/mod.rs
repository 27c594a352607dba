//! The `utils` module provides the pieces shared by every other module:
//! the crate's error types and tracing setup.

pub mod error;
pub mod logging;

#[cfg(test)]
mod tests {
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        logging::init("info");
        logging::init("debug");
        logging::init("warn");
    }

    #[test]
    fn level_names_are_normalized() {
        assert_eq!(logging::level_name("WARNING"), "warn");
        assert_eq!(logging::level_name(" trace "), "trace");
        assert_eq!(logging::level_name("verbose"), "info");
    }
}
