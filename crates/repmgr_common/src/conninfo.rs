//! libpq-style connection strings.
//!
//! Supports the `key=value` form (values optionally single-quoted with
//! backslash escapes) and `postgresql://` URIs. Parameter order is preserved
//! so that rewritten strings stay recognisable to the operator.

use crate::error::{RepmgrError, RepmgrResult};

/// Ordered list of connection parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnInfo {
    params: Vec<(String, String)>,
}

impl ConnInfo {
    pub fn parse(s: &str) -> RepmgrResult<Self> {
        let s = s.trim();
        if s.starts_with("postgresql://") || s.starts_with("postgres://") {
            return Self::parse_uri(s);
        }
        Self::parse_kv(s)
    }

    fn parse_kv(s: &str) -> RepmgrResult<Self> {
        let mut params = Vec::new();
        let mut chars = s.chars().peekable();
        loop {
            while chars.peek().map_or(false, |c| c.is_whitespace()) {
                chars.next();
            }
            if chars.peek().is_none() {
                break;
            }
            let mut key = String::new();
            while let Some(&c) = chars.peek() {
                if c == '=' || c.is_whitespace() {
                    break;
                }
                key.push(c);
                chars.next();
            }
            while chars.peek().map_or(false, |c| c.is_whitespace()) {
                chars.next();
            }
            if chars.next() != Some('=') {
                return Err(RepmgrError::bad_config(format!(
                    "missing \"=\" after \"{}\" in connection info string",
                    key
                )));
            }
            while chars.peek().map_or(false, |c| c.is_whitespace()) {
                chars.next();
            }
            let mut value = String::new();
            if chars.peek() == Some(&'\'') {
                chars.next();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(n) = chars.next() {
                                value.push(n);
                            }
                        }
                        '\'' => {
                            closed = true;
                            break;
                        }
                        _ => value.push(c),
                    }
                }
                if !closed {
                    return Err(RepmgrError::bad_config(
                        "unterminated quoted string in connection info string",
                    ));
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() {
                        break;
                    }
                    if c == '\\' {
                        chars.next();
                        if let Some(n) = chars.next() {
                            value.push(n);
                        }
                        continue;
                    }
                    value.push(c);
                    chars.next();
                }
            }
            if key.is_empty() {
                return Err(RepmgrError::bad_config("empty key in connection info string"));
            }
            params.push((key, value));
        }
        Ok(Self { params })
    }

    fn parse_uri(s: &str) -> RepmgrResult<Self> {
        let rest = s
            .split_once("://")
            .map(|(_, r)| r)
            .ok_or_else(|| RepmgrError::bad_config(format!("invalid URI \"{}\"", s)))?;
        let (main, query) = match rest.split_once('?') {
            Some((m, q)) => (m, Some(q)),
            None => (rest, None),
        };
        let (authority, dbname) = match main.split_once('/') {
            Some((a, d)) => (a, Some(d)),
            None => (main, None),
        };
        let mut params = Vec::new();
        let hostport = match authority.rsplit_once('@') {
            Some((userinfo, hp)) => {
                match userinfo.split_once(':') {
                    Some((u, p)) => {
                        params.push(("user".to_string(), u.to_string()));
                        params.push(("password".to_string(), p.to_string()));
                    }
                    None => params.push(("user".to_string(), userinfo.to_string())),
                }
                hp
            }
            None => authority,
        };
        let (host, port) = match hostport.find(']') {
            Some(end) => (
                hostport[..=end].trim_start_matches('[').trim_end_matches(']'),
                hostport[end + 1..].strip_prefix(':'),
            ),
            None => match hostport.rsplit_once(':') {
                Some((h, p)) => (h, Some(p)),
                None => (hostport, None),
            },
        };
        if !host.is_empty() {
            params.push(("host".to_string(), host.to_string()));
        }
        if let Some(p) = port.filter(|p| !p.is_empty()) {
            params.push(("port".to_string(), p.to_string()));
        }
        if let Some(db) = dbname.filter(|d| !d.is_empty()) {
            params.push(("dbname".to_string(), db.to_string()));
        }
        if let Some(q) = query {
            for pair in q.split('&').filter(|p| !p.is_empty()) {
                let (k, v) = pair.split_once('=').ok_or_else(|| {
                    RepmgrError::bad_config(format!("invalid URI query parameter \"{}\"", pair))
                })?;
                params.push((k.to_string(), v.to_string()));
            }
        }
        Ok(Self { params })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set `key`, replacing an existing value in place.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.params.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.params.push((key.to_string(), value.to_string())),
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.params.retain(|(k, _)| k != key);
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Host used for SSH: `host`, else `hostaddr`, else `localhost`.
    pub fn host(&self) -> &str {
        self.get("host")
            .or_else(|| self.get("hostaddr"))
            .unwrap_or("localhost")
    }

    /// Render in `key=value` form, quoting values where required.
    pub fn render(&self) -> String {
        self.params
            .iter()
            .map(|(k, v)| format!("{}={}", k, quote_value(v)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn quote_value(v: &str) -> String {
    if !v.is_empty() && !v.contains(|c: char| c.is_whitespace() || c == '\'' || c == '\\') {
        return v.to_string();
    }
    let mut out = String::with_capacity(v.len() + 2);
    out.push('\'');
    for c in v.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

/// Return `conninfo` with `key` set to `value`.
pub fn with_param(conninfo: &str, key: &str, value: &str) -> RepmgrResult<String> {
    let mut ci = ConnInfo::parse(conninfo)?;
    ci.set(key, value);
    Ok(ci.render())
}

/// Host part of a conninfo, for SSH targets.
pub fn host_of(conninfo: &str) -> RepmgrResult<String> {
    Ok(ConnInfo::parse(conninfo)?.host().to_string())
}
