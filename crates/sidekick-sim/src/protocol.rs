//! Benchmark protocol variants and how their trial clients are launched.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::{Auxiliary, Programs};
use crate::error::{Result, SimError};

/// A benchmarked transport configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    /// End-to-end TCP.
    Tcp,
    /// TCP split by the transparent proxy on the relay.
    Pep,
    /// End-to-end QUIC.
    Quic,
    /// QUIC assisted by the sidekick observer on the relay.
    Quack,
}

impl Protocol {
    pub const ALL: [Protocol; 4] = [Protocol::Tcp, Protocol::Pep, Protocol::Quic, Protocol::Quack];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Pep => "pep",
            Protocol::Quic => "quic",
            Protocol::Quack => "quack",
        }
    }

    /// Transport the trial client speaks.
    pub fn client_mode(&self) -> &'static str {
        match self {
            Protocol::Tcp | Protocol::Pep => "tcp",
            Protocol::Quic | Protocol::Quack => "quic",
        }
    }

    pub fn needs_proxy(&self) -> bool {
        matches!(self, Protocol::Pep)
    }

    pub fn needs_sidekick(&self) -> bool {
        matches!(self, Protocol::Quack)
    }

    /// Checks that the relay runs the auxiliary process this protocol needs.
    pub fn check_auxiliary(&self, aux: &Auxiliary) -> Result<()> {
        let ok = match self {
            Protocol::Pep => matches!(aux, Auxiliary::Proxy),
            Protocol::Quack => matches!(aux, Auxiliary::Sidekick(_)),
            Protocol::Tcp => !matches!(aux, Auxiliary::Proxy),
            Protocol::Quic => true,
        };
        if ok {
            Ok(())
        } else {
            Err(SimError::config(format!(
                "protocol {self} cannot run with relay auxiliary {aux:?}"
            )))
        }
    }

    /// argv for one trial transferring `data_size` (e.g. `10M`, `100k`).
    pub fn client_argv(&self, programs: &Programs, data_size: &str, timeout: Duration) -> Vec<String> {
        let mut argv = programs.client.clone();
        argv.extend([
            "-n".to_string(),
            data_size.to_string(),
            "-t".to_string(),
            "1".to_string(),
            "--timeout".to_string(),
            timeout.as_secs().max(1).to_string(),
            self.client_mode().to_string(),
        ]);
        argv
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" | "h1" | "http/1.1" => Ok(Protocol::Tcp),
            "pep" => Ok(Protocol::Pep),
            "quic" | "h3" | "http/3" => Ok(Protocol::Quic),
            "quack" | "sidekick" => Ok(Protocol::Quack),
            other => Err(SimError::config(format!("invalid benchmark: {other}"))),
        }
    }
}

/// Whether two flows may share the path in a multi-flow run.
///
/// ```text
///           pep quack quic tcp
///     pep   o   o     o    -
///     quack     x     o    o
///     quic              o  o
///     tcp                  o
/// ```
///
/// `-` is impossible: the proxy intercepts every TCP flow, so an end-to-end
/// TCP flow cannot coexist with a proxied one. `x` is unsupported: the
/// sidekick observer digests a single flow.
pub fn check_pairing(f1: Protocol, f2: Protocol) -> Result<()> {
    use Protocol::*;
    match (f1, f2) {
        (Tcp, Pep) | (Pep, Tcp) => Err(SimError::config(
            "a proxied TCP flow and an end-to-end TCP flow cannot run together",
        )),
        (Quack, Quack) => Err(SimError::config(
            "two sidekick-observed flows are not supported",
        )),
        _ => Ok(()),
    }
}

/// Relay auxiliary required to run the pair `(f1, f2)`.
pub fn pairing_auxiliary(f1: Protocol, f2: Protocol) -> (bool, bool) {
    (
        f1.needs_proxy() || f2.needs_proxy(),
        f1.needs_sidekick() || f2.needs_sidekick(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Cadence, SidekickConfig};

    #[test]
    fn pairing_matrix() {
        use Protocol::*;
        for (f1, f2, ok) in [
            (Pep, Pep, true),
            (Pep, Quack, true),
            (Pep, Quic, true),
            (Pep, Tcp, false),
            (Tcp, Pep, false),
            (Quack, Quack, false),
            (Quack, Quic, true),
            (Quack, Tcp, true),
            (Quic, Quic, true),
            (Quic, Tcp, true),
            (Tcp, Tcp, true),
        ] {
            assert_eq!(check_pairing(f1, f2).is_ok(), ok, "{f1} + {f2}");
        }
        assert_eq!(pairing_auxiliary(Pep, Quack), (true, true));
        assert_eq!(pairing_auxiliary(Tcp, Quic), (false, false));
    }

    #[test]
    fn auxiliary_requirements() {
        let sidekick = Auxiliary::Sidekick(SidekickConfig {
            cadence: Cadence::Millis(2),
            threshold: 20,
        });
        assert!(Protocol::Pep.check_auxiliary(&Auxiliary::Proxy).is_ok());
        assert!(Protocol::Pep.check_auxiliary(&Auxiliary::None).is_err());
        assert!(Protocol::Quack.check_auxiliary(&sidekick).is_ok());
        assert!(Protocol::Quack.check_auxiliary(&Auxiliary::None).is_err());
        assert!(Protocol::Tcp.check_auxiliary(&Auxiliary::Proxy).is_err());
        assert!(Protocol::Quic.check_auxiliary(&sidekick).is_ok());
    }

    #[test]
    fn client_argv_appends_mode() {
        let argv = Protocol::Pep.client_argv(&Programs::default(), "10M", Duration::from_secs(120));
        assert_eq!(
            argv,
            vec![
                "python3",
                "mininet/client.py",
                "-n",
                "10M",
                "-t",
                "1",
                "--timeout",
                "120",
                "tcp"
            ]
        );
        assert_eq!("h3".parse::<Protocol>().unwrap(), Protocol::Quic);
        assert!("sctp".parse::<Protocol>().is_err());
    }
}
