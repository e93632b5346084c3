use crate::error::VirtupError;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Largest guest memory accepted, 16 TiB. libvirt takes the value in KiB.
pub const MAX_MEMORY_MIB: u64 = 16 * 1024 * 1024;

/// Multiplier to MiB for a unit suffix, as a (numerator, denominator) pair.
///
/// Units are binary. `M`, `MB`, `MiB` and lowercase spellings all mean MiB,
/// matching how libvirt reads `<memory unit=...>`.
fn unit_to_mib(unit: &str) -> Option<(u64, u64)> {
    let unit = unit.to_ascii_lowercase();
    let base = unit
        .strip_suffix("ib")
        .or_else(|| unit.strip_suffix('b'))
        .filter(|u| !u.is_empty())
        .unwrap_or(&unit);
    match base {
        "" | "m" => Some((1, 1)),
        "b" => Some((1, MIB)),
        "k" => Some((1, 1024)),
        "g" => Some((1024, 1)),
        "t" => Some((1024 * 1024, 1)),
        _ => None,
    }
}

/// Parse a memory amount into MiB.
///
/// A bare number is MiB (`"2048"`). Suffixed values (`"512M"`, `"2G"`,
/// `"1GiB"`) are converted, rounding down. Anything under 1 MiB is rejected.
pub fn parse_memory_mib(s: &str) -> Result<u64, VirtupError> {
    let trimmed = s.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);

    let amount: u64 = digits.parse().map_err(|_| VirtupError::Validation {
        message: format!("invalid memory amount: '{trimmed}'"),
    })?;
    let (num, den) = unit_to_mib(unit.trim()).ok_or_else(|| VirtupError::Validation {
        message: format!("unknown memory unit '{unit}' in '{trimmed}' (use K, M, G or T)"),
    })?;
    let mib = amount
        .checked_mul(num)
        .ok_or_else(|| VirtupError::Validation {
            message: format!("memory amount too large: '{trimmed}'"),
        })?
        / den;

    if mib == 0 {
        return Err(VirtupError::Validation {
            message: format!("memory must be at least 1 MiB (got '{trimmed}')"),
        });
    }
    check_memory_mib(mib)?;
    Ok(mib)
}

/// Reject amounts above [`MAX_MEMORY_MIB`].
pub fn check_memory_mib(mib: u64) -> Result<(), VirtupError> {
    if mib > MAX_MEMORY_MIB {
        return Err(VirtupError::Validation {
            message: format!("memory of {mib} MiB exceeds the {MAX_MEMORY_MIB} MiB limit"),
        });
    }
    Ok(())
}

/// Human-readable byte count for listings.
pub fn format_size(bytes: u64) -> String {
    let (value, unit) = match bytes {
        b if b >= GIB => (b as f64 / GIB as f64, "GiB"),
        b if b >= MIB => (b as f64 / MIB as f64, "MiB"),
        b if b >= KIB => (b as f64 / KIB as f64, "KiB"),
        b => return format!("{b} B"),
    };
    format!("{value:.1} {unit}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_number_is_mib() {
        assert_eq!(parse_memory_mib("2048").unwrap(), 2048);
    }

    #[test]
    fn suffixes_in_any_spelling() {
        assert_eq!(parse_memory_mib("512M").unwrap(), 512);
        assert_eq!(parse_memory_mib("512mb").unwrap(), 512);
        assert_eq!(parse_memory_mib("2G").unwrap(), 2048);
        assert_eq!(parse_memory_mib("1GiB").unwrap(), 1024);
        assert_eq!(parse_memory_mib("2048K").unwrap(), 2);
    }

    #[test]
    fn rejects_zero_and_sub_mib() {
        assert!(parse_memory_mib("0").is_err());
        assert!(parse_memory_mib("512K").is_err());
        assert!(parse_memory_mib("0G").is_err());
        assert!(parse_memory_mib("4096B").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_memory_mib("").is_err());
        assert!(parse_memory_mib("G").is_err());
        assert!(parse_memory_mib("10X").is_err());
        assert!(parse_memory_mib("-1G").is_err());
    }

    #[test]
    fn rejects_overflow() {
        assert!(parse_memory_mib("18446744073709551615T").is_err());
    }

    #[test]
    fn rejects_beyond_limit() {
        assert_eq!(parse_memory_mib("16T").unwrap(), MAX_MEMORY_MIB);
        assert!(parse_memory_mib("17T").is_err());
        let err = parse_memory_mib("18014398509481984").unwrap_err();
        assert!(err.to_string().contains("limit"));
    }

    #[test]
    fn format_size_units() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2 * MIB), "2.0 MiB");
        assert_eq!(format_size(3 * GIB), "3.0 GiB");
    }
}
