use bigdecimal::BigDecimal;
use num_traits::ToPrimitive;

use crate::gateway::{PaymentError, PaymentResult};

/// Providers that bill in cents get the total rounded to two places first.
pub fn to_minor_units(amount: &BigDecimal) -> PaymentResult<i64> {
    (amount.round(2) * BigDecimal::from(100))
        .to_i64()
        .ok_or_else(|| PaymentError::Malformed(format!("amount {} out of range", amount)))
}

pub fn from_minor_units(cents: i64) -> BigDecimal {
    BigDecimal::new(cents.into(), 2)
}

pub fn from_json_number(number: &serde_json::Number) -> PaymentResult<BigDecimal> {
    number
        .to_string()
        .parse::<BigDecimal>()
        .map_err(|e| PaymentError::Malformed(format!("amount {}: {}", number, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn minor_units_conversion() {
        let amount = BigDecimal::from_str("250.50").unwrap();
        assert_eq!(to_minor_units(&amount).unwrap(), 25050);
        assert_eq!(from_minor_units(25050), amount);
    }

    #[test]
    fn json_numbers_keep_their_value() {
        let number = serde_json::Number::from_f64(99.9).unwrap();
        assert_eq!(from_json_number(&number).unwrap(), BigDecimal::from_str("99.9").unwrap());
    }
}
