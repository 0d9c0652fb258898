//! 五段式CRON表达式
//!
//! 存储和界面使用crontab顺序 `分 时 日 月 周`，匹配交给 `cron` 库完成。
//! 转换时补上秒字段，把星期字段换算成库的编号（1 = 星期日）。
//! 日与星期同时被限制时按传统cron语义取并集，拆成两个调度分别匹配。

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use ::cron::Schedule;
use chrono::{DateTime, Duration, Timelike, Utc};

use crate::errors::{KeeperError, KeeperResult};
use crate::models::CronFields;

const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// 编译后的五段式CRON表达式
#[derive(Debug, Clone)]
pub struct CronExpression {
    fields: CronFields,
    /// 一个调度，或日/星期取并集时的两个调度
    schedules: Vec<Schedule>,
}

impl CronExpression {
    /// 解析crontab顺序的表达式：`分 时 日 月 周`
    pub fn parse(expr: &str) -> KeeperResult<Self> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(KeeperError::InvalidCron {
                expr: expr.to_string(),
                message: format!("需要5个字段，实际为{}个", parts.len()),
            });
        }
        let fields = CronFields {
            minute: parts[0].to_string(),
            hour: parts[1].to_string(),
            day_of_month: parts[2].to_string(),
            month: parts[3].to_string(),
            day_of_week: parts[4].to_string(),
        };
        Self::from_fields(&fields)
    }

    pub fn from_fields(fields: &CronFields) -> KeeperResult<Self> {
        let fields = CronFields {
            minute: fields.minute.trim().to_string(),
            hour: fields.hour.trim().to_string(),
            day_of_month: fields.day_of_month.trim().to_string(),
            day_of_week: fields.day_of_week.trim().to_string(),
            month: fields.month.trim().to_string(),
        };
        let invalid = |message: String| KeeperError::InvalidCron {
            expr: fields.to_string(),
            message,
        };

        for (name, value) in [
            ("分钟", &fields.minute),
            ("小时", &fields.hour),
            ("日", &fields.day_of_month),
            ("月", &fields.month),
            ("星期", &fields.day_of_week),
        ] {
            check_list(name, value).map_err(invalid)?;
        }
        let day_of_week = weekday_ordinals(&fields.day_of_week).map_err(invalid)?;

        let compile = |day_of_month: &str, day_of_week: &str| {
            let source = format!(
                "0 {} {} {} {} {}",
                fields.minute, fields.hour, day_of_month, fields.month, day_of_week
            );
            Schedule::from_str(&source).map_err(|e| invalid(e.to_string()))
        };

        let schedules = if is_restricted(&fields.day_of_month) && is_restricted(&fields.day_of_week)
        {
            vec![compile(&fields.day_of_month, "*")?, compile("*", &day_of_week)?]
        } else {
            vec![compile(&fields.day_of_month, &day_of_week)?]
        };

        Ok(Self { fields, schedules })
    }

    pub fn validate(expr: &str) -> KeeperResult<()> {
        Self::parse(expr).map(|_| ())
    }

    pub fn fields(&self) -> &CronFields {
        &self.fields
    }

    /// 判断给定时刻所在的分钟是否匹配
    pub fn matches(&self, time: &DateTime<Utc>) -> bool {
        let minute = truncate_to_minute(*time);
        self.schedules.iter().any(|s| s.includes(minute))
    }

    /// `[from, to]` 区间内（分钟精度）最近一次匹配的分钟
    pub fn latest_match(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let from = truncate_to_minute(from);
        let mut minute = truncate_to_minute(to);
        while minute >= from {
            if self.matches(&minute) {
                return Some(minute);
            }
            minute = minute - Duration::minutes(1);
        }
        None
    }

    /// 严格晚于 `after` 的下一次触发时间
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|s| s.after(&after).next())
            .min()
    }
}

impl PartialEq for CronExpression {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl Eq for CronExpression {}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.fields, f)
    }
}

/// 字段是否受限（不以 `*` 开头）
fn is_restricted(field: &str) -> bool {
    !field.starts_with('*')
}

/// 列表项不能为空，步长必须大于0，数字范围不能倒置
fn check_list(name: &str, field: &str) -> Result<(), String> {
    if field.is_empty() {
        return Err(format!("{name}字段为空"));
    }
    for part in field.split(',') {
        if part.is_empty() {
            return Err(format!("{name}字段包含空的列表项: {field}"));
        }
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (part, None),
        };
        if let Some(step) = step {
            match step.parse::<u32>() {
                Ok(0) => return Err(format!("步长必须大于0: {part}")),
                Ok(_) => {}
                Err(_) => return Err(format!("无效的步长: {part}")),
            }
        }
        if let Some((a, b)) = range.split_once('-') {
            if let (Ok(a), Ok(b)) = (a.parse::<u32>(), b.parse::<u32>()) {
                if a > b {
                    return Err(format!("范围起点大于终点: {range}"));
                }
            }
        }
    }
    Ok(())
}

fn weekday_value(token: &str) -> Result<u32, String> {
    let value = match token.parse::<u32>() {
        Ok(value) => value,
        Err(_) => {
            let upper = token.to_ascii_uppercase();
            WEEKDAY_NAMES
                .iter()
                .position(|name| *name == upper)
                .map(|idx| idx as u32)
                .ok_or_else(|| format!("无效的星期取值: {token}"))?
        }
    };
    if value > 7 {
        return Err(format!("星期取值超出范围 0-7: {token}"));
    }
    Ok(value)
}

/// 把crontab星期字段（0或7 = 星期日）换算成 `cron` 库的编号列表（1 = 星期日）
fn weekday_ordinals(field: &str) -> Result<String, String> {
    if field == "*" {
        return Ok("*".to_string());
    }
    let mut days = BTreeSet::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step = step
                    .parse::<usize>()
                    .map_err(|_| format!("无效的步长: {part}"))?;
                (range, Some(step))
            }
            None => (part, None),
        };
        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            (weekday_value(a)?, weekday_value(b)?)
        } else {
            let value = weekday_value(range)?;
            match step {
                Some(_) => (value, 7),
                None => (value, value),
            }
        };
        for day in (start..=end).step_by(step.unwrap_or(1)) {
            days.insert(day % 7 + 1);
        }
    }
    Ok(days
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(","))
}

/// 截断到整分钟
pub fn truncate_to_minute(time: DateTime<Utc>) -> DateTime<Utc> {
    time.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(time)
}

/// 截断到整点
pub fn start_of_hour(time: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_minute(time).with_minute(0).unwrap_or(time)
}
