use chrono::{Datelike, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::str::FromStr;
use thiserror::Error;
use crate::{ConfigError, TaskError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid period {0:?}, expected YYYY-MM")]
pub struct ParsePeriodError(String);

/// One calendar month; the logical key of a DAG instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Result<Self, ParsePeriodError> {
        NaiveDate::from_ymd_opt(year, month, 1)
            .map(|_| Self { year, month })
            .ok_or_else(|| ParsePeriodError(format!("{year:04}-{month:02}")))
    }

    /// The month `date` falls in.
    pub fn containing(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self { year: self.year + 1, month: 1 }
        } else {
            Self { year: self.year, month: self.month + 1 }
        }
    }

    pub fn previous(&self) -> Self {
        if self.month == 1 {
            Self { year: self.year - 1, month: 12 }
        } else {
            Self { year: self.year, month: self.month - 1 }
        }
    }

    /// Logical date of a monthly schedule firing on `today`: the last full month.
    pub fn last_complete(today: NaiveDate) -> Self {
        Self::containing(today).previous()
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = ParsePeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParsePeriodError(s.to_string());
        let (year, month) = s.trim().split_once('-').ok_or_else(err)?;
        let digits = |part: &str, len: usize| part.len() == len && part.bytes().all(|b| b.is_ascii_digit());
        if !digits(year, 4) || !digits(month, 2) {
            return Err(err());
        }
        let year: i32 = year.parse().map_err(|_| err())?;
        let month: u32 = month.parse().map_err(|_| err())?;
        Self::new(year, month).map_err(|_| err())
    }
}

impl TryFrom<String> for Period {
    type Error = ParsePeriodError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Period> for String {
    fn from(period: Period) -> Self {
        period.to_string()
    }
}

/// Named strftime templates evaluated at midnight UTC on the first day of the period.
///
/// `period`, `year`, `month` and `month_unpadded` are always derived; a template
/// with one of those names replaces the builtin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamRules {
    templates: BTreeMap<String, String>,
}

impl ParamRules {
    pub fn new<I, K, V>(templates: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let templates: BTreeMap<String, String> = templates
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let sample = Period { year: 2000, month: 1 };
        for (name, template) in &templates {
            if format_period(sample, template).is_err() {
                return Err(ConfigError::InvalidTemplate {
                    name: name.clone(),
                    template: template.clone(),
                });
            }
        }
        Ok(Self { templates })
    }

    pub fn templates(&self) -> &BTreeMap<String, String> {
        &self.templates
    }

    pub fn derive(&self, period: Period) -> PeriodContext {
        let mut params = BTreeMap::from([
            ("period".to_string(), period.to_string()),
            ("year".to_string(), format!("{:04}", period.year)),
            ("month".to_string(), format!("{:02}", period.month)),
            ("month_unpadded".to_string(), period.month.to_string()),
        ]);
        for (name, template) in &self.templates {
            // Templates were checked in `new`; a failure here would be a chrono bug.
            let value = format_period(period, template).unwrap_or_default();
            params.insert(name.clone(), value);
        }
        PeriodContext { period, params }
    }
}

fn format_period(period: Period, template: &str) -> Result<String, fmt::Error> {
    let at = Utc.from_utc_datetime(&period.first_day().and_time(NaiveTime::MIN));
    let mut out = String::new();
    write!(out, "{}", at.format(template))?;
    Ok(out)
}

/// Parameters of one DAG instance. Built fresh per trigger and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodContext {
    period: Period,
    params: BTreeMap<String, String>,
}

impl PeriodContext {
    pub fn period(&self) -> Period {
        self.period
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn require(&self, name: &str) -> Result<&str, TaskError> {
        self.param(name)
            .ok_or_else(|| TaskError::permanent(format!("missing param {name}")))
    }

    /// Substitute `{name}` placeholders with derived params. `{{` and `}}` escape braces.
    pub fn render(&self, template: &str) -> Result<String, TaskError> {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(ch) => name.push(ch),
                            None => {
                                return Err(TaskError::permanent(format!(
                                    "unterminated placeholder in {template:?}"
                                )));
                            }
                        }
                    }
                    out.push_str(self.require(name.trim())?);
                }
                _ => out.push(c),
            }
        }
        Ok(out)
    }
}
