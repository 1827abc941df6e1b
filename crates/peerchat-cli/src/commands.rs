//! Input line parsing and startup argument normalisation.

use anyhow::{bail, Context, Result};
use rand::Rng;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;

/// Ports a node may listen on.
pub const PORT_RANGE: RangeInclusive<u16> = 20000..=21000;

/// Length every username is cut or padded to.
pub const USERNAME_LEN: usize = 5;

const USERNAME_STRIP: &[char] = &[
    '\'', '"', '\\', ':', '@', '#', '$', '!', '~', '%', '^', '&', '*', '(', ')', '_', '+',
];

/// One line typed by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    /// `!conn host:port`
    Connect {
        /// IPv4 address.
        host: String,
        /// Port.
        port: u16,
    },
    /// `!enc <cipher>`
    Encrypt(String),
    /// `!quit`
    Quit,
    /// Anything else.
    Text(String),
}

impl UserCommand {
    /// Parse a trimmed input line.
    pub fn parse(line: &str) -> Result<Self> {
        if line == "!quit" {
            return Ok(Self::Quit);
        }
        if let Some(rest) = line.strip_prefix("!conn") {
            let (host, port) = parse_address(rest.trim())?;
            return Ok(Self::Connect { host, port });
        }
        if let Some(rest) = line.strip_prefix("!enc") {
            let cipher = rest.trim();
            if cipher.is_empty() {
                bail!("Usage: !enc <cipher>");
            }
            return Ok(Self::Encrypt(cipher.to_string()));
        }
        Ok(Self::Text(line.to_string()))
    }
}

/// Validate an `ip:port` pair.
pub fn parse_address(candidate: &str) -> Result<(String, u16)> {
    let Some((ip, port)) = candidate.split_once(':') else {
        bail!("Invalid input, expected ip:port");
    };
    let ip: Ipv4Addr = ip
        .parse()
        .with_context(|| format!("Invalid IP address '{ip}'"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("Invalid port '{port}'"))?;
    if port == 0 {
        bail!("Invalid port '0'");
    }
    Ok((ip.to_string(), port))
}

/// Strip forbidden characters, then cut to [`USERNAME_LEN`] or pad with
/// random hex.
pub fn sanitize_username(raw: &str, rng: &mut impl Rng) -> String {
    let mut name: String = raw
        .chars()
        .filter(|c| !USERNAME_STRIP.contains(c) && !c.is_whitespace() && !c.is_control())
        .take(USERNAME_LEN)
        .collect();

    let missing = USERNAME_LEN - name.chars().count();
    if missing > 0 {
        let mut pad = [0u8; USERNAME_LEN];
        rng.fill(&mut pad[..]);
        name.push_str(&hex::encode(pad)[..missing]);
    }
    name
}

/// Use the requested port when it is in [`PORT_RANGE`], otherwise a random
/// one from it.
pub fn pick_port(requested: Option<u16>, rng: &mut impl Rng) -> u16 {
    match requested {
        Some(port) if PORT_RANGE.contains(&port) => port,
        _ => rng.gen_range(PORT_RANGE),
    }
}
