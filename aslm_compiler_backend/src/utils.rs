use std::time::Instant;

use regex::Regex;
use tracing::debug;

use crate::error::{ConfigError, Result};

// Utility class for time-tracking
pub struct TickTimer {
    last: Instant,
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    // Milliseconds since construction or the previous tick
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let diff = now.duration_since(self.last).as_secs_f64() * 1e3;
        self.last = now;
        diff
    }

    pub fn tick_print(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        debug!(elapsed_ms = diff, "{}", msg);
        diff
    }
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits an analog output address of form `board/ao(number)` (e.g. `PXI6259/ao0`)
/// into its board prefix and line number. A leading `/` is accepted.
pub fn split_ao_address(address: &str) -> Result<(&str, usize)> {
    let invalid = || ConfigError::InvalidAddress {
        address: address.to_string(),
        expected: "board/ao(number)".to_string(),
    };
    let re = Regex::new(r"^/?([^/\s]+)/ao(\d+)$").map_err(|_| invalid())?;
    let caps = re.captures(address).ok_or_else(invalid)?;
    let board = caps.get(1).ok_or_else(invalid)?.as_str();
    let line = caps[2].parse::<usize>().map_err(|_| invalid())?;
    Ok((board, line))
}

#[cfg(test)]
mod test {
    use crate::utils::*;

    #[test]
    fn ao_address() {
        assert_eq!(split_ao_address("PXI6259/ao0"), Ok(("PXI6259", 0)));
        assert_eq!(split_ao_address("/PXI6733/ao12"), Ok(("PXI6733", 12)));
        assert!(split_ao_address("PXI6259/port0/line1").is_err());
        assert!(split_ao_address("ao0").is_err());
        assert!(split_ao_address("PXI6259/ao").is_err());
    }
}
