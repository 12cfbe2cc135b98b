//! Measurement unit normalization.
//!
//! Recipes arrive in whatever unit the back office entered them in; the
//! stock ledger runs on canonical base units (kilograms for mass, liters for
//! volume). Count-style units ("pcs", "pieces", unknown symbols) pass
//! through unchanged so the function is total.

/// Convert `quantity` expressed in `unit` to the canonical base unit.
///
/// Never fails: an unrecognized symbol is treated as already-base.
pub fn to_base_unit(quantity: f64, unit: &str) -> f64 {
    match unit.trim().to_ascii_lowercase().as_str() {
        "mg" => quantity / 1_000_000.0,
        "g" => quantity / 1_000.0,
        "kg" => quantity,
        "ml" => quantity / 1_000.0,
        "cl" => quantity / 100.0,
        "l" => quantity,
        _ => quantity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mass_normalizes_to_kilograms() {
        assert_eq!(to_base_unit(500.0, "g"), 0.5);
        assert_eq!(to_base_unit(2.0, "kg"), 2.0);
        assert_eq!(to_base_unit(250_000.0, "mg"), 0.25);
    }

    #[test]
    fn test_volume_normalizes_to_liters() {
        assert_eq!(to_base_unit(1.0, "l"), 1.0);
        assert_eq!(to_base_unit(330.0, "ml"), 0.33);
        assert_eq!(to_base_unit(50.0, "cl"), 0.5);
    }

    #[test]
    fn test_counts_and_unknown_symbols_pass_through() {
        assert_eq!(to_base_unit(3.0, "pcs"), 3.0);
        assert_eq!(to_base_unit(12.0, "pieces"), 12.0);
        assert_eq!(to_base_unit(7.0, "crate"), 7.0);
    }

    #[test]
    fn test_symbol_matching_is_trimmed_and_case_insensitive() {
        assert_eq!(to_base_unit(500.0, " G "), 0.5);
        assert_eq!(to_base_unit(2.0, "KG"), 2.0);
        assert_eq!(to_base_unit(100.0, "Ml"), 0.1);
    }
}
