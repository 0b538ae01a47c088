use std::env;

lazy_static! {
    static ref FLAGS: Flags = init_flags();
}

bitflags! {
    /// Which error detectors run at an epoch boundary. The detectors
    /// themselves live in the external allocator library; these gates only
    /// control whether their results are consulted.
    pub struct Detectors: u32 {
        const OVERFLOW = 1 << 0;
        const LEAKS = 1 << 1;
        const UAF = 1 << 2;
    }
}

#[derive(Clone)]
pub struct Flags {
    /// Minimum level that gets printed. 0 = debug, 4 = fatal only.
    pub log_level: i32,
    /// Enabled detector set.
    pub detectors: Detectors,
}

impl Flags {
    pub fn get() -> &'static Flags {
        &*FLAGS
    }

    pub fn detect_overflow(&self) -> bool {
        self.detectors.contains(Detectors::OVERFLOW)
    }

    pub fn detect_leaks(&self) -> bool {
        self.detectors.contains(Detectors::LEAKS)
    }

    pub fn detect_uaf(&self) -> bool {
        self.detectors.contains(Detectors::UAF)
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => v != "0" && !v.eq_ignore_ascii_case("false"),
        Err(_) => default,
    }
}

pub fn init_flags() -> Flags {
    let log_level = env::var("REWIND_LOG_LEVEL")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(crate::log::LogLevel::LogWarn as i32);

    let mut detectors = Detectors::empty();
    if env_bool("REWIND_DETECT_OVERFLOW", true) {
        detectors |= Detectors::OVERFLOW;
    }
    if env_bool("REWIND_DETECT_LEAKS", false) {
        detectors |= Detectors::LEAKS;
    }
    if env_bool("REWIND_DETECT_UAF", true) {
        detectors |= Detectors::UAF;
    }

    Flags {
        log_level,
        detectors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_bool_parsing() {
        env::set_var("REWIND_TEST_GATE", "0");
        assert!(!env_bool("REWIND_TEST_GATE", true));
        env::set_var("REWIND_TEST_GATE", "false");
        assert!(!env_bool("REWIND_TEST_GATE", true));
        env::set_var("REWIND_TEST_GATE", "1");
        assert!(env_bool("REWIND_TEST_GATE", false));
        env::remove_var("REWIND_TEST_GATE");
        assert!(env_bool("REWIND_TEST_GATE", true));
        assert!(!env_bool("REWIND_TEST_GATE", false));
    }

    #[test]
    fn gate_accessors() {
        let flags = Flags {
            log_level: 2,
            detectors: Detectors::OVERFLOW | Detectors::UAF,
        };
        assert!(flags.detect_overflow());
        assert!(flags.detect_uaf());
        assert!(!flags.detect_leaks());
    }
}
