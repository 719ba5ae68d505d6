//! Kubernetes resource quantity parsing
//!
//! Converts quantity strings such as `250m`, `1.5`, `512Mi` or `2e3` into
//! plain numbers (cores for CPU, bytes for memory).

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid quantity {raw:?}: {reason}")]
pub struct QuantityError {
    pub raw: String,
    pub reason: String,
}

impl QuantityError {
    fn new(raw: &str, reason: impl Into<String>) -> Self {
        Self {
            raw: raw.to_string(),
            reason: reason.into(),
        }
    }
}

/// Parse a quantity string into a number in base units
pub fn parse_quantity(raw: &str) -> Result<f64, QuantityError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(QuantityError::new(raw, "empty"));
    }

    let split = s
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || ((*c == '+' || *c == '-') && *i == 0)))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);

    let base: f64 = number
        .parse()
        .map_err(|_| QuantityError::new(raw, "not a number"))?;

    let multiplier = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        exp if exp.starts_with(['e', 'E']) => {
            let power: i32 = exp[1..]
                .parse()
                .map_err(|_| QuantityError::new(raw, "bad exponent"))?;
            10f64.powi(power)
        }
        other => {
            return Err(QuantityError::new(raw, format!("unknown suffix {:?}", other)));
        }
    };

    let value = base * multiplier;
    if !value.is_finite() || value < 0.0 {
        return Err(QuantityError::new(raw, "out of range"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9 * b.abs().max(1.0)
    }

    #[test]
    fn test_cpu_quantities() {
        assert!(approx(parse_quantity("250m").unwrap(), 0.25));
        assert!(approx(parse_quantity("1").unwrap(), 1.0));
        assert!(approx(parse_quantity("1.5").unwrap(), 1.5));
        assert!(approx(parse_quantity("100000u").unwrap(), 0.1));
    }

    #[test]
    fn test_memory_quantities() {
        assert_eq!(parse_quantity("128Mi").unwrap(), 134_217_728.0);
        assert_eq!(parse_quantity("1Gi").unwrap(), 1_073_741_824.0);
        assert_eq!(parse_quantity("1G").unwrap(), 1e9);
        assert_eq!(parse_quantity("512k").unwrap(), 512_000.0);
        assert_eq!(parse_quantity("2e3").unwrap(), 2000.0);
        assert_eq!(parse_quantity("1E6").unwrap(), 1e6);
        assert_eq!(parse_quantity("1E").unwrap(), 1e18);
    }

    #[test]
    fn test_zero_is_a_value() {
        assert_eq!(parse_quantity("0").unwrap(), 0.0);
    }

    #[test]
    fn test_invalid_quantities() {
        assert!(parse_quantity("").is_err());
        assert!(parse_quantity("abc").is_err());
        assert!(parse_quantity("12Xi").is_err());
        assert!(parse_quantity("-1").is_err());
        assert!(parse_quantity("1e").is_err());
    }
}
