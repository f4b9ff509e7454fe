use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Fixed-point decimal scalar: a 128-bit integer mantissa with a decimal
/// scale in 0..=28. Arithmetic aligns scales exactly for add/sub/mul;
/// division falls back to 16 fractional digits.
#[derive(Clone, Copy, Debug)]
pub struct Decimal {
    mantissa: i128,
    scale: u32,
}

pub const MAX_SCALE: u32 = 28;

impl Decimal {
    pub const ZERO: Decimal = Decimal { mantissa: 0, scale: 0 };

    pub fn new(mantissa: i128, scale: u32) -> Self {
        Decimal { mantissa, scale: scale.min(MAX_SCALE) }.normalized()
    }

    pub fn from_i64(value: i64) -> Self {
        Decimal { mantissa: value as i128, scale: 0 }
    }

    pub fn from_f64(value: f64) -> Self {
        // 15 significant fractional digits is the most an f64 round-trips.
        let scaled = (value * 1e15).round();
        if scaled.is_finite() {
            Decimal { mantissa: scaled as i128, scale: 15 }.normalized()
        } else {
            Decimal::ZERO
        }
    }

    pub fn mantissa(&self) -> i128 {
        self.mantissa
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn to_f64(&self) -> f64 {
        self.mantissa as f64 / 10f64.powi(self.scale as i32)
    }

    pub fn to_i64(&self) -> i64 {
        (self.mantissa / pow10(self.scale)) as i64
    }

    pub fn is_zero(&self) -> bool {
        self.mantissa == 0
    }

    /// Strip trailing zeros from the fractional part.
    fn normalized(mut self) -> Self {
        while self.scale > 0 && self.mantissa % 10 == 0 {
            self.mantissa /= 10;
            self.scale -= 1;
        }
        self
    }

    /// Express both operands at a common scale.
    fn aligned(self, other: Decimal) -> (i128, i128, u32) {
        let scale = self.scale.max(other.scale);
        let a = self.mantissa.saturating_mul(pow10(scale - self.scale));
        let b = other.mantissa.saturating_mul(pow10(scale - other.scale));
        (a, b, scale)
    }

    pub fn checked_add(self, other: Decimal) -> Decimal {
        let (a, b, scale) = self.aligned(other);
        Decimal::new(a.saturating_add(b), scale)
    }

    pub fn checked_sub(self, other: Decimal) -> Decimal {
        let (a, b, scale) = self.aligned(other);
        Decimal::new(a.saturating_sub(b), scale)
    }

    pub fn checked_mul(self, other: Decimal) -> Decimal {
        let mut scale = self.scale + other.scale;
        let mut mantissa = self.mantissa.saturating_mul(other.mantissa);
        while scale > MAX_SCALE {
            mantissa /= 10;
            scale -= 1;
        }
        Decimal::new(mantissa, scale)
    }

    pub fn checked_div(self, other: Decimal) -> Option<Decimal> {
        if other.mantissa == 0 {
            return None;
        }
        let (a, b, _) = self.aligned(other);
        let mantissa = a.saturating_mul(pow10(16)).checked_div(b)?;
        Some(Decimal::new(mantissa, 16))
    }
}

fn pow10(exp: u32) -> i128 {
    10i128.saturating_pow(exp)
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Decimal {}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Decimal {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b, _) = self.aligned(*other);
        a.cmp(&b)
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.mantissa);
        }
        let sign = if self.mantissa < 0 { "-" } else { "" };
        let abs = self.mantissa.unsigned_abs();
        let divisor = pow10(self.scale) as u128;
        let whole = abs / divisor;
        let frac = abs % divisor;
        write!(f, "{sign}{whole}.{frac:0width$}", width = self.scale as usize)
    }
}

impl FromStr for Decimal {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        let s = s.trim();
        let (int_part, frac_part) = match s.split_once('.') {
            Some((i, fr)) => (i, fr),
            None => (s, ""),
        };
        if frac_part.len() as u32 > MAX_SCALE {
            return Err(());
        }
        let mut digits = String::with_capacity(int_part.len() + frac_part.len());
        digits.push_str(int_part);
        digits.push_str(frac_part);
        let mantissa: i128 = digits.parse().map_err(|_| ())?;
        Ok(Decimal::new(mantissa, frac_part.len() as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let d: Decimal = "123.450".parse().unwrap();
        assert_eq!(d.to_string(), "123.45");
        assert_eq!(d.scale(), 2);

        let neg: Decimal = "-0.5".parse().unwrap();
        assert_eq!(neg.to_string(), "-0.5");
    }

    #[test]
    fn arithmetic_aligns_scales() {
        let a: Decimal = "1.5".parse().unwrap();
        let b: Decimal = "2.25".parse().unwrap();
        assert_eq!(a.checked_add(b).to_string(), "3.75");
        assert_eq!(b.checked_sub(a).to_string(), "0.75");
        assert_eq!(a.checked_mul(b).to_string(), "3.375");
        assert_eq!(b.checked_div(a).unwrap().to_string(), "1.5");
    }

    #[test]
    fn compare_across_scales() {
        let a: Decimal = "1.50".parse().unwrap();
        let b: Decimal = "1.5".parse().unwrap();
        assert_eq!(a, b);
        assert!("2".parse::<Decimal>().unwrap() > a);
    }

    #[test]
    fn division_by_zero_is_none() {
        let a: Decimal = "1".parse().unwrap();
        assert!(a.checked_div(Decimal::ZERO).is_none());
    }
}
