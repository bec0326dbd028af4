//! Reporting period resolution.
//!
//! Turns a reference date and a month offset into the (year, month) a run
//! reports on, plus the stable folder name and file label derived from it.

use crate::error::{ReportError, Result};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Characters rejected by at least one supported filesystem.
pub const ILLEGAL_PATH_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

// Precomposed (NFC) spellings; one canonical form per locale.
const PT_BR_MONTHS: [&str; 12] = [
    "janeiro",
    "fevereiro",
    "mar\u{e7}o",
    "abril",
    "maio",
    "junho",
    "julho",
    "agosto",
    "setembro",
    "outubro",
    "novembro",
    "dezembro",
];

const EN_MONTHS: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

/// Locale used to spell the period folder name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Locale {
    /// Brazilian Portuguese (`junho'25`).
    #[default]
    PtBr,
    /// English (`june'25`).
    En,
}

impl Locale {
    /// Parses a locale tag such as `pt-BR`, `pt_BR`, `pt`, `en` or `en-US`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "pt-br" | "pt" => Some(Self::PtBr),
            "en" | "en-us" | "en-gb" => Some(Self::En),
            _ => None,
        }
    }

    /// Canonical tag for this locale.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::PtBr => "pt-BR",
            Self::En => "en",
        }
    }

    /// Lowercase month name for `month` in 1..=12.
    fn month_name(&self, month: u32) -> &'static str {
        let index = (month.clamp(1, 12) - 1) as usize;
        match self {
            Self::PtBr => PT_BR_MONTHS[index],
            Self::En => EN_MONTHS[index],
        }
    }
}

impl TryFrom<String> for Locale {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("Unknown locale '{value}'. Expected pt-BR or en"))
    }
}

impl From<Locale> for String {
    fn from(locale: Locale) -> Self {
        locale.tag().to_string()
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// The calendar month a run reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ReportingPeriod {
    year: i32,
    month: u32,
    locale: Locale,
}

impl ReportingPeriod {
    /// Creates a period, validating that `month` is in 1..=12.
    pub fn new(year: i32, month: u32, locale: Locale) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(ReportError::config(format!(
                "Month must be between 1 and 12 (got {month})"
            )));
        }
        Ok(Self {
            year,
            month,
            locale,
        })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn locale(&self) -> Locale {
        self.locale
    }

    /// `YYYY-MM`, used in artifact file names.
    pub fn label(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }

    /// Period folder name: the locale month name and a two-digit year, e.g. `junho'25`.
    pub fn folder_name(&self) -> String {
        format!(
            "{}'{:02}",
            self.locale.month_name(self.month),
            self.year.rem_euclid(100)
        )
    }
}

impl fmt::Display for ReportingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Resolves the period `month_offset` months before `reference`.
///
/// An offset of 0 is the reference month itself; 1 is the month before,
/// rolling over into the previous year from January.
pub fn resolve(reference: NaiveDate, month_offset: i64, locale: Locale) -> Result<ReportingPeriod> {
    if month_offset < 0 {
        return Err(ReportError::invalid_offset(format!(
            "offset must not be negative (got {month_offset})"
        )));
    }

    let months_since_epoch = i64::from(reference.year()) * 12 + i64::from(reference.month0());
    let target = months_since_epoch
        .checked_sub(month_offset)
        .ok_or_else(|| ReportError::invalid_offset(format!("offset {month_offset} is out of range")))?;

    let year = i32::try_from(target.div_euclid(12))
        .map_err(|_| ReportError::invalid_offset(format!("offset {month_offset} is out of range")))?;
    let month = target.rem_euclid(12) as u32 + 1;

    ReportingPeriod::new(year, month, locale)
}

/// Parses a month offset from user input.
///
/// Anything that is not a non-negative whole number is an `InvalidOffset` error.
pub fn parse_month_offset(s: &str) -> Result<i64> {
    let offset: i64 = s.trim().parse().map_err(|_| {
        ReportError::invalid_offset(format!("'{s}' is not a whole number of months"))
    })?;
    if offset < 0 {
        return Err(ReportError::invalid_offset(format!(
            "offset must not be negative (got {offset})"
        )));
    }
    Ok(offset)
}

/// Returns true if `name` can be used as a single path component on
/// Windows and Unix filesystems.
pub fn is_filesystem_safe(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.ends_with('.')
        && !name.ends_with(' ')
        && !name
            .chars()
            .any(|c| c.is_control() || ILLEGAL_PATH_CHARS.contains(&c))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_previous_month() {
        let period = resolve(date(2025, 7, 15), 1, Locale::PtBr).unwrap();
        assert_eq!((period.year(), period.month()), (2025, 6));
        assert_eq!(period.label(), "2025-06");
        assert_eq!(period.folder_name(), "junho'25");
    }

    #[test]
    fn test_year_rollover() {
        let period = resolve(date(2025, 1, 10), 1, Locale::PtBr).unwrap();
        assert_eq!((period.year(), period.month()), (2024, 12));
        assert_eq!(period.folder_name(), "dezembro'24");
    }

    #[test]
    fn test_zero_and_large_offsets() {
        let same = resolve(date(2025, 3, 31), 0, Locale::En).unwrap();
        assert_eq!(same.label(), "2025-03");

        let far = resolve(date(2025, 3, 31), 27, Locale::En).unwrap();
        assert_eq!(far.label(), "2022-12");
        assert_eq!(far.folder_name(), "december'22");
    }

    #[test]
    fn test_negative_offset_is_rejected() {
        let result = resolve(date(2025, 7, 15), -1, Locale::PtBr);
        assert!(matches!(result, Err(ReportError::InvalidOffset(_))));
    }

    #[test]
    fn test_parse_month_offset() {
        assert_eq!(parse_month_offset("1").unwrap(), 1);
        assert_eq!(parse_month_offset(" 12 ").unwrap(), 12);
        assert!(matches!(
            parse_month_offset("1.5"),
            Err(ReportError::InvalidOffset(_))
        ));
        assert!(matches!(
            parse_month_offset("one"),
            Err(ReportError::InvalidOffset(_))
        ));
        assert!(matches!(
            parse_month_offset("-3"),
            Err(ReportError::InvalidOffset(_))
        ));
    }

    #[test]
    fn test_folder_name_is_stable_and_canonical() {
        let a = resolve(date(2025, 4, 2), 1, Locale::PtBr).unwrap();
        let b = resolve(date(2025, 4, 28), 1, Locale::PtBr).unwrap();
        assert_eq!(a.folder_name(), b.folder_name());

        // precomposed c-cedilla, not c + combining cedilla
        let name = a.folder_name();
        assert_eq!(name, "mar\u{e7}o'25");
        assert_eq!(name.chars().count(), 8);
        assert!(!name.contains('\u{327}'));
    }

    #[test]
    fn test_every_folder_name_is_filesystem_safe() {
        for locale in [Locale::PtBr, Locale::En] {
            for month in 1..=12 {
                let period = ReportingPeriod::new(2009, month, locale).unwrap();
                let name = period.folder_name();
                assert!(is_filesystem_safe(&name), "unsafe folder name {name}");
                assert!(name.ends_with("'09"));
            }
        }
    }

    #[test]
    fn test_invalid_month() {
        assert!(ReportingPeriod::new(2025, 0, Locale::PtBr).is_err());
        assert!(ReportingPeriod::new(2025, 13, Locale::PtBr).is_err());
    }

    #[test]
    fn test_locale_parse() {
        assert_eq!(Locale::parse("pt-BR"), Some(Locale::PtBr));
        assert_eq!(Locale::parse("pt_BR"), Some(Locale::PtBr));
        assert_eq!(Locale::parse("EN-us"), Some(Locale::En));
        assert_eq!(Locale::parse("fr"), None);
    }

    #[test]
    fn test_is_filesystem_safe() {
        assert!(is_filesystem_safe("Cupons Ativos_2025-06.xlsx"));
        assert!(!is_filesystem_safe("a/b"));
        assert!(!is_filesystem_safe("a:b"));
        assert!(!is_filesystem_safe("trailing."));
        assert!(!is_filesystem_safe(""));
        assert!(!is_filesystem_safe(".."));
    }
}
