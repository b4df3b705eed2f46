use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};

use crate::client::{ClientConfig, Protocol};

pub(crate) const PUBLIC_URL: &str = "slideruleearth.io";
pub(crate) const PUBLIC_ORG: &str = "sliderule";

#[derive(Debug, Default, PartialEq)]
pub(crate) struct RcConfig {
    pub(crate) domain: Option<String>,
    /// `Some(None)` when the file explicitly disables the organization.
    pub(crate) organization: Option<Option<String>>,
    pub(crate) protocol: Option<Protocol>,
    pub(crate) verify: Option<bool>,
}

pub(crate) fn load_config(
    domain: Option<String>,
    organization: Option<Option<String>>,
    verify: Option<bool>,
) -> Result<ClientConfig> {
    let mut domain = domain.or_else(|| std::env::var("SLIDERULE_DOMAIN").ok());
    let mut organization = organization.or_else(|| {
        std::env::var("SLIDERULE_ORGANIZATION")
            .ok()
            .map(|v| parse_organization(&v))
    });
    let mut protocol = match std::env::var("SLIDERULE_PROTOCOL") {
        Ok(v) => Some(parse_protocol(&v)?),
        Err(_) => None,
    };
    let mut file_verify: Option<bool> = None;

    if domain.is_none() || organization.is_none() || protocol.is_none() || verify.is_none() {
        for rc_path in &rc_candidates() {
            if rc_path.exists() {
                let cfg = read_rc(rc_path).with_context(|| {
                    format!("failed to read configuration file {}", rc_path.display())
                })?;

                if domain.is_none() {
                    domain = cfg.domain;
                }
                if organization.is_none() {
                    organization = cfg.organization;
                }
                if protocol.is_none() {
                    protocol = cfg.protocol;
                }
                file_verify = cfg.verify;
                break;
            }
        }
    }

    let domain = domain.unwrap_or_else(|| PUBLIC_URL.to_string());
    let organization = organization.unwrap_or_else(|| Some(PUBLIC_ORG.to_string()));
    let verify = verify.or(file_verify).unwrap_or(true);

    let mut cfg = ClientConfig::new(domain, organization);
    if let Some(protocol) = protocol {
        cfg = cfg.with_protocol(protocol);
    }
    Ok(cfg.with_verify(verify))
}

pub(crate) fn read_rc(path: &Path) -> Result<RcConfig> {
    let text = std::fs::read_to_string(path)?;
    let mut cfg = RcConfig::default();

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((k, v)) = line.split_once(':') {
            let v = strip_quotes(v.trim());
            if v.is_empty() {
                continue;
            }
            match k.trim() {
                "domain" | "url" => cfg.domain = Some(v.to_string()),
                "organization" => cfg.organization = Some(parse_organization(v)),
                "protocol" => cfg.protocol = Some(parse_protocol(v)?),
                "verify" => cfg.verify = Some(v != "0" && !v.eq_ignore_ascii_case("false")),
                _ => {}
            }
        }
    }

    Ok(cfg)
}

fn parse_organization(v: &str) -> Option<String> {
    let v = v.trim();
    if v.is_empty() || v.eq_ignore_ascii_case("none") || v.eq_ignore_ascii_case("null") {
        None
    } else {
        Some(v.to_string())
    }
}

fn parse_protocol(v: &str) -> Result<Protocol> {
    match v.trim().to_ascii_lowercase().as_str() {
        "http" => Ok(Protocol::Http),
        "https" => Ok(Protocol::Https),
        other => bail!("unsupported protocol [{}] (expected http or https)", other),
    }
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    if (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
        || (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn rc_candidates() -> Vec<PathBuf> {
    // 1) SLIDERULE_RC (explicit)
    // 2) ./.sliderulerc
    // 3) ~/.sliderulerc
    if let Ok(p) = std::env::var("SLIDERULE_RC") {
        return vec![PathBuf::from(p)];
    }

    let mut v = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        v.push(cwd.join(".sliderulerc"));
    }
    if let Some(home) = dirs::home_dir() {
        v.push(home.join(".sliderulerc"));
    }
    v
}

/// Provisioning system credentials: environment first, then `~/.netrc`.
pub(crate) fn load_credentials(machine: &str) -> Result<Option<(String, String)>> {
    if let (Ok(user), Ok(pass)) = (std::env::var("PS_USERNAME"), std::env::var("PS_PASSWORD")) {
        if !user.is_empty() && !pass.is_empty() {
            return Ok(Some((user, pass)));
        }
    }

    let path = match std::env::var("NETRC") {
        Ok(p) => PathBuf::from(p),
        Err(_) => match dirs::home_dir() {
            Some(home) => home.join(".netrc"),
            None => return Ok(None),
        },
    };
    if !path.exists() {
        return Ok(None);
    }

    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(netrc_lookup(&text, machine))
}

pub(crate) fn netrc_lookup(text: &str, machine: &str) -> Option<(String, String)> {
    let mut tokens = text.split_whitespace();
    let mut in_machine = false;
    let mut login: Option<String> = None;
    let mut password: Option<String> = None;

    while let Some(tok) = tokens.next() {
        match tok {
            "machine" => {
                if in_machine {
                    break;
                }
                in_machine = tokens.next().is_some_and(|m| m.eq_ignore_ascii_case(machine));
            }
            "default" => {
                if in_machine {
                    break;
                }
            }
            "login" if in_machine => login = tokens.next().map(str::to_string),
            "password" if in_machine => password = tokens.next().map(str::to_string),
            _ => {}
        }
    }

    match (login, password) {
        (Some(l), Some(p)) => Some((l, p)),
        _ => None,
    }
}
