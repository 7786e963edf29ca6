// Docker-style resource strings from compiler records ("512m", "1.5")

use crate::error::EngineError;

/// Parse a memory limit such as `512m`, `1g`, `256k`, `1024b` or plain bytes
pub fn parse_memory(value: &str) -> Result<i64, EngineError> {
    let trimmed = value.trim().to_ascii_lowercase();
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('b') => (&trimmed[..trimmed.len() - 1], 1),
        Some('k') => (&trimmed[..trimmed.len() - 1], 1024),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed.as_str(), 1),
    };
    let amount: i64 = digits
        .parse()
        .map_err(|_| EngineError::Policy(format!("invalid memory limit {:?}", value)))?;
    if amount <= 0 {
        return Err(EngineError::Policy(format!(
            "memory limit must be positive, got {:?}",
            value
        )));
    }
    amount
        .checked_mul(multiplier)
        .ok_or_else(|| EngineError::Policy(format!("memory limit {:?} overflows", value)))
}

/// Parse a CPU share such as `1` or `0.5` into nano-CPUs
pub fn parse_nano_cpus(value: &str) -> Result<i64, EngineError> {
    let cpus: f64 = value
        .trim()
        .parse()
        .map_err(|_| EngineError::Policy(format!("invalid cpu limit {:?}", value)))?;
    if !cpus.is_finite() || cpus <= 0.0 {
        return Err(EngineError::Policy(format!(
            "cpu limit must be positive, got {:?}",
            value
        )));
    }
    Ok((cpus * 1_000_000_000.0) as i64)
}
