use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use jobrunner_errors::{JobError, JobResult};

/// CRON表达式解析
///
/// 支持标准的5段表达式（分钟精度），以及带秒的6段/7段表达式。
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> JobResult<Self> {
        let trimmed = expression.trim();
        let normalized = match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            6 | 7 => trimmed.to_string(),
            fields => {
                return Err(JobError::InvalidCron {
                    expr: expression.to_string(),
                    message: format!("需要5到7个字段，实际为{fields}个"),
                })
            }
        };

        let schedule = Schedule::from_str(&normalized).map_err(|e| JobError::InvalidCron {
            expr: expression.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    pub fn validate(expression: &str) -> JobResult<()> {
        Self::parse(expression).map(|_| ())
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// 严格晚于 `after` 的下一次触发时间
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    pub fn upcoming(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(&from).take(count).collect()
    }
}

/// 常用的CRON表达式
pub struct Cron;

impl Cron {
    pub fn minutely() -> String {
        "* * * * *".to_string()
    }

    pub fn hourly() -> String {
        Self::hourly_at(0)
    }

    pub fn hourly_at(minute: u32) -> String {
        format!("{minute} * * * *")
    }

    pub fn daily() -> String {
        Self::daily_at(0, 0)
    }

    pub fn daily_at(hour: u32, minute: u32) -> String {
        format!("{minute} {hour} * * *")
    }

    /// 每周一零点
    pub fn weekly() -> String {
        "0 0 * * Mon".to_string()
    }

    pub fn monthly() -> String {
        Self::monthly_at(1, 0, 0)
    }

    pub fn monthly_at(day: u32, hour: u32, minute: u32) -> String {
        format!("{minute} {hour} {day} * *")
    }

    pub fn yearly() -> String {
        "0 0 1 1 *".to_string()
    }

    pub fn minute_interval(interval: u32) -> String {
        format!("*/{interval} * * * *")
    }
}
