use serde::Serialize;

use crate::error::{CoreError, CoreResult};

/// Permitted amil percentages, held as basis points of 1/10000 so the split
/// is exact integer arithmetic: 0%, 5%, 7.5%, 12.5%, 20%, 100%.
pub const AMIL_RATES_BP: &[i64] = &[0, 500, 750, 1250, 2000, 10_000];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub amil_cents: i64,
    pub bersih_cents: i64,
}

/// Splits a gross receipt into the amil fee and the net amount.
///
/// The amil amount is rounded half-up; the net amount is the exact
/// remainder and is never rounded on its own, so
/// `amil_cents + bersih_cents == jumlah_cents` always holds.
pub fn allocate(jumlah_cents: i64, rate_bp: i64) -> CoreResult<Allocation> {
    if jumlah_cents <= 0 {
        return Err(CoreError::InvalidAllocationInput(format!(
            "jumlah harus lebih dari 0, diterima {jumlah_cents}"
        )));
    }
    if !AMIL_RATES_BP.contains(&rate_bp) {
        return Err(CoreError::InvalidAllocationInput(format!(
            "persentase amil tidak dikenal: {}",
            format_rate_bp(rate_bp)
        )));
    }
    let scaled = jumlah_cents.checked_mul(rate_bp).ok_or_else(|| {
        CoreError::InvalidAllocationInput(format!("jumlah melewati batas: {jumlah_cents}"))
    })?;
    let amil_cents = (scaled + 5_000) / 10_000;
    Ok(Allocation {
        amil_cents,
        bersih_cents: jumlah_cents - amil_cents,
    })
}

/// Parses a percentage written as `12.5`, `12,5` or `12.5%` into basis
/// points, accepting only the fixed rate set.
pub fn parse_amil_rate_bp(raw: &str) -> CoreResult<i64> {
    let text = raw.trim().trim_end_matches('%').trim().replace(',', ".");
    let bp = match text.as_str() {
        "0" | "0.0" => 0,
        "5" | "5.0" => 500,
        "7.5" => 750,
        "12.5" => 1_250,
        "20" | "20.0" => 2_000,
        "100" | "100.0" => 10_000,
        _ => {
            return Err(CoreError::InvalidAllocationInput(format!(
                "persentase amil tidak dikenal: {raw}"
            )))
        }
    };
    Ok(bp)
}

pub fn format_rate_bp(rate_bp: i64) -> String {
    if rate_bp % 100 == 0 {
        format!("{}%", rate_bp / 100)
    } else {
        format!("{}.{}%", rate_bp / 100, (rate_bp % 100) / 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_the_documented_example() {
        // Rp1.000.000 at 12.5% -> Rp125.000 amil, Rp875.000 net.
        let split = allocate(100_000_000, 1_250).expect("allocate");
        assert_eq!(split.amil_cents, 12_500_000);
        assert_eq!(split.bersih_cents, 87_500_000);
    }

    #[test]
    fn amil_plus_net_equals_gross_for_every_rate() {
        let amounts: &[i64] = &[1, 3, 7, 99, 101, 12_345, 1_000_001, 99_999_999_999];
        for &jumlah in amounts {
            for &bp in AMIL_RATES_BP {
                let split = allocate(jumlah, bp).expect("allocate");
                assert_eq!(
                    split.amil_cents + split.bersih_cents,
                    jumlah,
                    "drift at jumlah={jumlah} bp={bp}"
                );
                assert!(split.amil_cents >= 0);
                assert!(split.bersih_cents >= 0);
            }
        }
    }

    #[test]
    fn rounds_half_up() {
        // 10 cents at 5% is exactly 0.5 cents of amil.
        assert_eq!(allocate(10, 500).expect("allocate").amil_cents, 1);
        // 1 cent at 5% is 0.05 cents, below the half-cent threshold.
        assert_eq!(allocate(1, 500).expect("allocate").amil_cents, 0);
        // 7.5% of 333 cents is 24.975, rounds to 25.
        assert_eq!(allocate(333, 750).expect("allocate").amil_cents, 25);
    }

    #[test]
    fn full_rate_leaves_no_net() {
        let split = allocate(123_456, 10_000).expect("allocate");
        assert_eq!(split.amil_cents, 123_456);
        assert_eq!(split.bersih_cents, 0);
    }

    #[test]
    fn rejects_invalid_input() {
        assert!(matches!(
            allocate(0, 500),
            Err(CoreError::InvalidAllocationInput(_))
        ));
        assert!(matches!(
            allocate(-100, 500),
            Err(CoreError::InvalidAllocationInput(_))
        ));
        assert!(matches!(
            allocate(1_000, 300),
            Err(CoreError::InvalidAllocationInput(_))
        ));
    }

    #[test]
    fn parses_rate_spellings() {
        assert_eq!(parse_amil_rate_bp("12.5").expect("rate"), 1_250);
        assert_eq!(parse_amil_rate_bp("12,5%").expect("rate"), 1_250);
        assert_eq!(parse_amil_rate_bp(" 7.5 % ").expect("rate"), 750);
        assert_eq!(parse_amil_rate_bp("0").expect("rate"), 0);
        assert_eq!(parse_amil_rate_bp("100").expect("rate"), 10_000);
        assert!(parse_amil_rate_bp("10").is_err());
        assert!(parse_amil_rate_bp("").is_err());
    }

    #[test]
    fn formats_rates() {
        assert_eq!(format_rate_bp(750), "7.5%");
        assert_eq!(format_rate_bp(1_250), "12.5%");
        assert_eq!(format_rate_bp(2_000), "20%");
    }
}
