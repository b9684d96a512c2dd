//! Kernel command-line parsing.

use log::LevelFilter;

pub const DEFAULT_TIMER_HZ: u32 = 100;

/// Settings the kernel takes from its command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig<'a> {
    /// `loglevel=<off|error|warn|info|debug|trace>`
    pub log_level: Option<LevelFilter>,
    /// Cleared by `nosmp`.
    pub smp: bool,
    /// `pic` keeps the legacy 8259 even when I/O APICs are present.
    pub force_pic: bool,
    /// `hz=<n>`
    pub timer_hz: u32,
    /// `init=<path>`
    pub init: Option<&'a str>,
}

impl Default for KernelConfig<'_> {
    fn default() -> Self {
        Self {
            log_level: None,
            smp: true,
            force_pic: false,
            timer_hz: DEFAULT_TIMER_HZ,
            init: None,
        }
    }
}

/// Whitespace-separated `key=value` and bare `flag` tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandLine<'a>(&'a str);

impl<'a> CommandLine<'a> {
    pub const fn new(line: &'a str) -> Self {
        Self(line)
    }

    pub fn as_str(&self) -> &'a str {
        self.0
    }

    pub fn tokens(&self) -> impl Iterator<Item = (&'a str, Option<&'a str>)> + 'a {
        self.0.split_ascii_whitespace().map(|token| match token.split_once('=') {
            Some((key, value)) => (key, Some(value)),
            None => (token, None),
        })
    }

    /// Value of the last `key=` occurrence.
    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.tokens()
            .filter(|(k, _)| *k == key)
            .filter_map(|(_, v)| v)
            .last()
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.tokens().any(|(k, v)| k == flag && v.is_none())
    }

    /// Builds a [`KernelConfig`]. Unknown tokens and malformed values are
    /// logged and ignored; the command line can never stop the kernel from
    /// booting.
    pub fn parse(&self) -> KernelConfig<'a> {
        let mut config = KernelConfig::default();
        for (key, value) in self.tokens() {
            match (key, value) {
                ("loglevel", Some(level)) => match level.parse() {
                    Ok(level) => config.log_level = Some(level),
                    Err(_) => log::warn!("ignoring invalid loglevel={level}"),
                },
                ("nosmp", None) => config.smp = false,
                ("pic", None) => config.force_pic = true,
                ("hz", Some(hz)) => match hz.parse::<u32>() {
                    Ok(hz) if (1..=10_000).contains(&hz) => config.timer_hz = hz,
                    _ => log::warn!("ignoring invalid hz={hz}"),
                },
                ("init", Some(path)) if !path.is_empty() => config.init = Some(path),
                _ => log::debug!("ignoring unknown command-line token {key}"),
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_line_gives_defaults() {
        assert_eq!(CommandLine::new("").parse(), KernelConfig::default());
        assert_eq!(KernelConfig::default().timer_hz, 100);
    }

    #[test]
    fn parses_every_known_option() {
        let config = CommandLine::new("loglevel=debug nosmp  pic hz=250 init=/sbin/init").parse();
        assert_eq!(
            config,
            KernelConfig {
                log_level: Some(LevelFilter::Debug),
                smp: false,
                force_pic: true,
                timer_hz: 250,
                init: Some("/sbin/init"),
            }
        );
    }

    #[test]
    fn malformed_values_keep_defaults() {
        let config = CommandLine::new("loglevel=loud hz=0 hz=fast init=").parse();
        assert_eq!(config, KernelConfig::default());
    }

    #[test]
    fn unknown_tokens_are_ignored() {
        let config = CommandLine::new("quiet splash root=/dev/sda1 nosmp").parse();
        assert!(!config.smp);
    }

    #[test]
    fn later_values_win() {
        let line = CommandLine::new("hz=50 hz=1000");
        assert_eq!(line.get("hz"), Some("1000"));
        assert_eq!(line.parse().timer_hz, 1000);
    }

    #[test]
    fn flags_need_no_value() {
        let line = CommandLine::new("nosmp=1 pic");
        assert!(!line.has_flag("nosmp"));
        assert!(line.has_flag("pic"));
        assert!(line.parse().smp);
    }
}
