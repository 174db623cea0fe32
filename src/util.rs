use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static PRICE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").expect("valid regex"));

/// Largest accepted price. Eleven digits keep a payment button payload, with
/// a uuid project id, inside the 64-byte callback limit.
pub const MAX_PRICE: i64 = 99_999_999_999;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PriceError {
  #[error("price must be a whole number")]
  InvalidFormat,
  #[error("price must be greater than zero")]
  Zero,
  #[error("price exceeds supported range")]
  OutOfRange,
}

/// Parses a whole-unit price. Balances carry no fractional part.
pub fn parse_price(input: &str) -> Result<i64, PriceError> {
  let trimmed = input.trim();
  if !PRICE_PATTERN.is_match(trimmed) {
    return Err(PriceError::InvalidFormat);
  }
  let value = trimmed.parse::<i64>().map_err(|_| PriceError::OutOfRange)?;
  if value == 0 {
    return Err(PriceError::Zero);
  }
  if value > MAX_PRICE {
    return Err(PriceError::OutOfRange);
  }
  Ok(value)
}

pub fn format_price(amount: i64, currency: &str) -> String {
  format!("{amount} {currency}")
}

pub fn parse_due_date(input: &str) -> Option<NaiveDate> {
  NaiveDate::parse_from_str(input.trim(), DATE_FORMAT).ok()
}

/// `YYYY-MM-DD` rendered as `DD.MM`; anything else is shown as stored.
pub fn render_due_date(input: &str) -> String {
  match parse_due_date(input) {
    Some(date) => date.format("%d.%m").to_string(),
    None => input.to_string(),
  }
}
