//! The zone-masters file.
//!
//! Global settings followed by `master` blocks:
//!
//! ```text
//! transfer_interval 300
//! transfer_timeout 300
//! max_retries 3
//! retry_delay 60
//!
//! master primary-ns {
//!     host 198.51.100.1;
//!     port 53;
//!     tsig_key xfer-key hmac-sha256 c2VjcmV0c2VjcmV0;
//!     zones {
//!         example.com.;
//!         example.net.;
//!     }
//! }
//! ```
//!
//! `#` starts a comment anywhere.

use std::net::IpAddr;

use palisade_proto::Name;

use super::ConfigError;
use crate::tsig::{Algorithm, Key};

//----------- TransferSettings -------------------------------------------------

/// Global transfer scheduling knobs, in seconds.
#[derive(Clone, Copy, Debug)]
pub struct TransferSettings {
    /// How often the scheduler walks slave zones.
    pub interval: u64,
    /// The per-transfer deadline.
    pub timeout: u64,
    /// Consecutive failures before a zone is benched until the next
    /// interval.
    pub max_retries: u32,
    /// Base delay of the exponential backoff.
    pub retry_delay: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            interval: 300,
            timeout: 300,
            max_retries: 3,
            retry_delay: 60,
        }
    }
}

//----------- MasterConfig -----------------------------------------------------

/// One master block: where to transfer from, how to authenticate, and which
/// zones it feeds.
#[derive(Clone, Debug)]
pub struct MasterConfig {
    pub name: String,
    pub host: IpAddr,
    pub port: u16,
    /// Name of the TSIG key to sign transfer traffic with.
    pub tsig_key: Option<Name>,
    pub zones: Vec<Name>,
}

impl MasterConfig {
    /// The master block feeding `zone`, if any.
    pub fn for_zone<'a>(masters: &'a [MasterConfig], zone: &Name) -> Option<&'a MasterConfig> {
        masters.iter().find(|m| m.zones.iter().any(|z| z == zone))
    }
}

/// Everything a zone-masters file defines.
#[derive(Debug, Default)]
pub struct MastersFile {
    pub settings: TransferSettings,
    pub masters: Vec<MasterConfig>,
    /// Keys declared inline via `tsig_key`; merged into the keyring.
    pub keys: Vec<Key>,
}

//----------- Parser -----------------------------------------------------------

/// A token with the line it came from, for error reporting.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Token {
    text: String,
    line: usize,
}

/// Split into words, braces and semicolons, stripping comments.
fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = lineno + 1;
        let content = raw.split('#').next().unwrap_or("");
        let mut word = String::new();
        for c in content.chars() {
            match c {
                '{' | '}' | ';' => {
                    if !word.is_empty() {
                        tokens.push(Token {
                            text: std::mem::take(&mut word),
                            line,
                        });
                    }
                    tokens.push(Token {
                        text: c.to_string(),
                        line,
                    });
                }
                c if c.is_whitespace() => {
                    if !word.is_empty() {
                        tokens.push(Token {
                            text: std::mem::take(&mut word),
                            line,
                        });
                    }
                }
                c => word.push(c),
            }
        }
        if !word.is_empty() {
            tokens.push(Token { text: word, line });
        }
    }
    tokens
}

struct Cursor {
    tokens: Vec<Token>,
    pos: usize,
}

impl Cursor {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += token.is_some() as usize;
        token
    }

    fn line(&self) -> usize {
        self.peek()
            .map(|t| t.line)
            .or_else(|| self.tokens.last().map(|t| t.line))
            .unwrap_or(0)
    }

    fn expect(&mut self, what: &str, reason: &'static str) -> Result<Token, ConfigError> {
        match self.next() {
            Some(token) if token.text == what => Ok(token),
            _ => Err(self.error(reason)),
        }
    }

    fn word(&mut self, reason: &'static str) -> Result<Token, ConfigError> {
        match self.next() {
            Some(token) if !matches!(token.text.as_str(), "{" | "}" | ";") => Ok(token),
            _ => Err(self.error(reason)),
        }
    }

    fn error(&self, reason: &'static str) -> ConfigError {
        ConfigError::Masters {
            line: self.line(),
            reason,
        }
    }
}

/// Parse a zone-masters file.
pub fn parse(text: &str) -> Result<MastersFile, ConfigError> {
    let mut cursor = Cursor {
        tokens: tokenize(text),
        pos: 0,
    };
    let mut file = MastersFile::default();

    while let Some(token) = cursor.next() {
        match token.text.as_str() {
            "transfer_interval" => file.settings.interval = global_value(&mut cursor)?,
            "transfer_timeout" => file.settings.timeout = global_value(&mut cursor)?,
            "max_retries" => file.settings.max_retries = global_value(&mut cursor)? as u32,
            "retry_delay" => file.settings.retry_delay = global_value(&mut cursor)?,
            "master" => {
                let (master, key) = parse_master(&mut cursor)?;
                file.masters.push(master);
                if let Some(key) = key {
                    file.keys.push(key);
                }
            }
            _ => {
                return Err(ConfigError::Masters {
                    line: token.line,
                    reason: "unknown directive",
                })
            }
        }
    }
    Ok(file)
}

fn global_value(cursor: &mut Cursor) -> Result<u64, ConfigError> {
    let token = cursor.word("expected a numeric value")?;
    let value = token.text.parse().map_err(|_| ConfigError::Masters {
        line: token.line,
        reason: "expected a numeric value",
    })?;
    // A trailing semicolon is tolerated on global settings.
    if cursor.peek().is_some_and(|t| t.text == ";") {
        cursor.next();
    }
    Ok(value)
}

fn parse_master(cursor: &mut Cursor) -> Result<(MasterConfig, Option<Key>), ConfigError> {
    let name = cursor.word("expected a master name")?;
    cursor.expect("{", "expected '{' after the master name")?;

    let mut host: Option<IpAddr> = None;
    let mut port = 53u16;
    let mut key: Option<Key> = None;
    let mut zones = Vec::new();

    loop {
        let token = cursor
            .next()
            .ok_or_else(|| cursor.error("unterminated master block"))?;
        match token.text.as_str() {
            "}" => break,
            "host" => {
                let value = cursor.word("expected an address after 'host'")?;
                host = Some(value.text.parse().map_err(|_| ConfigError::Masters {
                    line: value.line,
                    reason: "invalid master address",
                })?);
                cursor.expect(";", "expected ';'")?;
            }
            "port" => {
                let value = cursor.word("expected a port after 'port'")?;
                port = value.text.parse().map_err(|_| ConfigError::Masters {
                    line: value.line,
                    reason: "invalid port",
                })?;
                cursor.expect(";", "expected ';'")?;
            }
            "tsig_key" => {
                let key_name = cursor.word("expected a key name")?;
                let algorithm = cursor.word("expected a key algorithm")?;
                let secret = cursor.word("expected a base64 secret")?;
                cursor.expect(";", "expected ';'")?;

                use base64::Engine;
                let key_name: Name =
                    key_name.text.parse().map_err(|_| ConfigError::Masters {
                        line: key_name.line,
                        reason: "invalid key name",
                    })?;
                let algorithm = Algorithm::from_config_name(&algorithm.text).ok_or(
                    ConfigError::Masters {
                        line: algorithm.line,
                        reason: "unknown TSIG algorithm",
                    },
                )?;
                let secret = base64::engine::general_purpose::STANDARD
                    .decode(&secret.text)
                    .map_err(|_| ConfigError::Masters {
                        line: token.line,
                        reason: "secret is not valid base64",
                    })?;
                key = Some(Key::new(key_name, algorithm, secret));
            }
            "zones" => {
                cursor.expect("{", "expected '{' after 'zones'")?;
                loop {
                    let token = cursor
                        .next()
                        .ok_or_else(|| cursor.error("unterminated zones block"))?;
                    match token.text.as_str() {
                        "}" => break,
                        ";" => {}
                        zone => {
                            zones.push(zone.parse().map_err(|_| ConfigError::Masters {
                                line: token.line,
                                reason: "invalid zone name",
                            })?);
                        }
                    }
                }
            }
            _ => {
                return Err(ConfigError::Masters {
                    line: token.line,
                    reason: "unknown master option",
                })
            }
        }
    }

    let host = host.ok_or_else(|| cursor.error("master block lacks a host"))?;
    Ok((
        MasterConfig {
            name: name.text,
            host,
            port,
            tsig_key: key.as_ref().map(|k| k.name.clone()),
            zones,
        },
        key,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    #[test]
    fn full_file_parses() {
        let file = parse(
            r#"
            # global tuning
            transfer_interval 600
            transfer_timeout 120
            max_retries 5
            retry_delay 30

            master primary {
                host 198.51.100.1;
                port 5300;
                tsig_key xfer. hmac-sha256 c2VjcmV0c2VjcmV0c2VjcmV0;
                zones {
                    example.com.;
                    example.net.;
                }
            }

            master backup {
                host 2001:db8::53;
                zones { example.org.; }
            }
            "#,
        )
        .unwrap();

        assert_eq!(file.settings.interval, 600);
        assert_eq!(file.settings.timeout, 120);
        assert_eq!(file.settings.max_retries, 5);
        assert_eq!(file.settings.retry_delay, 30);

        assert_eq!(file.masters.len(), 2);
        let primary = &file.masters[0];
        assert_eq!(primary.name, "primary");
        assert_eq!(primary.port, 5300);
        assert_eq!(primary.tsig_key, Some(name("xfer.")));
        assert_eq!(primary.zones.len(), 2);

        let backup = &file.masters[1];
        assert_eq!(backup.port, 53);
        assert!(backup.tsig_key.is_none());
        assert_eq!(backup.zones, vec![name("example.org.")]);

        assert_eq!(file.keys.len(), 1);
        assert_eq!(file.keys[0].name, name("xfer."));
    }

    #[test]
    fn missing_host_is_an_error() {
        let err = parse("master broken { zones { example.com.; } }").unwrap_err();
        assert!(matches!(err, ConfigError::Masters { .. }));
    }

    #[test]
    fn comments_and_empty_files() {
        let file = parse("# nothing here\n\n").unwrap();
        assert!(file.masters.is_empty());
        assert_eq!(file.settings.interval, TransferSettings::default().interval);
    }

    #[test]
    fn zone_lookup_by_master() {
        let file = parse(
            "master a { host 192.0.2.1; zones { one.test.; } }\n\
             master b { host 192.0.2.2; zones { two.test.; } }",
        )
        .unwrap();
        let found = MasterConfig::for_zone(&file.masters, &name("two.test.")).unwrap();
        assert_eq!(found.name, "b");
        assert!(MasterConfig::for_zone(&file.masters, &name("three.test.")).is_none());
    }
}
