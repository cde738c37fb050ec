use jobrunner_errors::{JobError, JobResult};

pub trait ConfigValidator {
    fn validate(&self) -> JobResult<()>;
}

pub struct ValidationUtils;

impl ValidationUtils {
    pub fn validate_not_empty(value: &str, field_name: &str) -> JobResult<()> {
        if value.trim().is_empty() {
            return Err(JobError::config_error(format!("{field_name} 不能为空")));
        }
        Ok(())
    }

    pub fn validate_positive(value: u64, field_name: &str) -> JobResult<()> {
        if value == 0 {
            return Err(JobError::config_error(format!("{field_name} 必须大于0")));
        }
        Ok(())
    }

    pub fn validate_count(count: usize, field_name: &str, max: usize) -> JobResult<()> {
        if count == 0 {
            return Err(JobError::config_error(format!("{field_name} 必须大于0")));
        }
        if count > max {
            return Err(JobError::config_error(format!(
                "{field_name} 不能超过 {max}"
            )));
        }
        Ok(())
    }

    pub fn validate_ratio(value: f64, field_name: &str) -> JobResult<()> {
        if !(0.0..=1.0).contains(&value) {
            return Err(JobError::config_error(format!(
                "{field_name} 必须在 0.0 到 1.0 之间"
            )));
        }
        Ok(())
    }

    pub fn validate_one_of(value: &str, field_name: &str, allowed: &[&str]) -> JobResult<()> {
        if !allowed.contains(&value) {
            return Err(JobError::config_error(format!(
                "{field_name} 的值 '{value}' 无效，可选值: {allowed:?}"
            )));
        }
        Ok(())
    }
}
