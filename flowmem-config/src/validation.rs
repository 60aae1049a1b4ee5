//! Custom validation functions shared by the configuration sections.

use validator::ValidationError;

/// Validate that a contiguous-record limit is a power of two.
pub fn validate_power_of_two(value: u16) -> Result<(), ValidationError> {
    if value.is_power_of_two() {
        Ok(())
    } else {
        Err(ValidationError::new("must_be_power_of_two"))
    }
}

/// Validate that a log filter names at least one directive.
pub fn validate_log_filter(filter: &str) -> Result<(), ValidationError> {
    if filter.split(',').any(|directive| !directive.trim().is_empty()) {
        Ok(())
    } else {
        Err(ValidationError::new("empty_log_filter"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_of_two() {
        for value in [1u16, 2, 4, 8] {
            assert!(validate_power_of_two(value).is_ok());
        }
        for value in [0u16, 3, 6] {
            assert!(validate_power_of_two(value).is_err());
        }
    }

    #[test]
    fn log_filter() {
        assert!(validate_log_filter("info,flowmem_core=debug").is_ok());
        assert!(validate_log_filter(" , ").is_err());
    }
}
