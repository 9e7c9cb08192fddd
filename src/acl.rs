//! Access control.
//!
//! One evaluator serves every plane entry: plain DNS, the recursive cache,
//! DoH and the management surfaces.  Rules live in the store's bounded ACL
//! pool and are walked under the read lock; deny wins over allow, and the
//! presence of any allow rule for a target turns that target into an
//! allow-list.

use std::fmt;
use std::net::IpAddr;

use crate::db::AclRow;
use crate::metrics::bump;
use crate::store::Store;

//----------- Target -----------------------------------------------------------

/// What a rule applies to.  `System` rules apply to every target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    System,
    Master,
    Slave,
    Cache,
    Webui,
    Doh,
}

impl Target {
    fn parse(s: &str) -> Option<Self> {
        Some(match s.to_ascii_lowercase().as_str() {
            "system" => Self::System,
            "master" => Self::Master,
            "slave" => Self::Slave,
            "cache" => Self::Cache,
            "webui" => Self::Webui,
            "doh" => Self::Doh,
            _ => return None,
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::System => "system",
            Self::Master => "master",
            Self::Slave => "slave",
            Self::Cache => "cache",
            Self::Webui => "webui",
            Self::Doh => "doh",
        })
    }
}

//----------- RuleKind ---------------------------------------------------------

/// The predicate of a rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuleKind {
    /// Exact address match.
    Ip(IpAddr),
    /// Prefix match; v4 and v6 both supported.
    Cidr { addr: IpAddr, prefix: u8 },
    /// Case-insensitive ISO country code match.
    Country(String),
    /// Autonomous system number equality.
    Asn(u32),
}

impl RuleKind {
    fn matches(&self, ip: IpAddr, country: Option<&str>, asn: Option<u32>) -> bool {
        match self {
            Self::Ip(rule_ip) => *rule_ip == ip,
            Self::Cidr { addr, prefix } => cidr_contains(*addr, *prefix, ip),
            Self::Country(code) => {
                country.is_some_and(|c| c.eq_ignore_ascii_case(code))
            }
            Self::Asn(rule_asn) => asn == Some(*rule_asn),
        }
    }
}

/// Prefix containment for both address families.  A family mismatch never
/// matches.
fn cidr_contains(net: IpAddr, prefix: u8, ip: IpAddr) -> bool {
    match (net, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            let prefix = prefix.min(32);
            if prefix == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - prefix);
            u32::from(net) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            let prefix = prefix.min(128);
            if prefix == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - prefix);
            u128::from(net) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}

//----------- AclRule ----------------------------------------------------------

/// What happens when a rule matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Allow,
    Deny,
}

/// One access-control rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AclRule {
    pub id: u32,
    pub kind: RuleKind,
    pub target: Target,
    pub action: Action,
    pub enabled: bool,
}

impl AclRule {
    /// Parse a backing-store row.  Unknown kinds, targets or malformed
    /// values are reported so that the loader can log and skip them.
    pub fn from_row(row: &AclRow) -> Result<Self, AclParseError> {
        let target = Target::parse(&row.target).ok_or(AclParseError::BadTarget)?;
        let action = match row.action.to_ascii_lowercase().as_str() {
            "allow" => Action::Allow,
            "deny" => Action::Deny,
            _ => return Err(AclParseError::BadAction),
        };
        let kind = match row.kind.to_ascii_lowercase().as_str() {
            "ip" => RuleKind::Ip(row.value.parse().map_err(|_| AclParseError::BadValue)?),
            "cidr" => parse_cidr(&row.value).ok_or(AclParseError::BadValue)?,
            "country" => {
                if row.value.len() != 2 || !row.value.bytes().all(|b| b.is_ascii_alphabetic()) {
                    return Err(AclParseError::BadValue);
                }
                RuleKind::Country(row.value.to_ascii_uppercase())
            }
            "asn" => RuleKind::Asn(row.value.parse().map_err(|_| AclParseError::BadValue)?),
            _ => return Err(AclParseError::BadKind),
        };
        Ok(Self {
            id: row.id,
            kind,
            target,
            action,
            enabled: row.enabled,
        })
    }
}

/// Parse `addr/prefix`.  A bare address is a host route.
pub fn parse_cidr(s: &str) -> Option<RuleKind> {
    match s.split_once('/') {
        Some((addr, prefix)) => {
            let addr: IpAddr = addr.parse().ok()?;
            let prefix: u8 = prefix.parse().ok()?;
            let max = if addr.is_ipv4() { 32 } else { 128 };
            (prefix <= max).then_some(RuleKind::Cidr { addr, prefix })
        }
        None => {
            let addr: IpAddr = s.parse().ok()?;
            let prefix = if addr.is_ipv4() { 32 } else { 128 };
            Some(RuleKind::Cidr { addr, prefix })
        }
    }
}

//----------- AclParseError ----------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AclParseError {
    BadKind,
    BadTarget,
    BadAction,
    BadValue,
}

impl fmt::Display for AclParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BadKind => "unknown rule kind",
            Self::BadTarget => "unknown rule target",
            Self::BadAction => "unknown rule action",
            Self::BadValue => "malformed rule value",
        })
    }
}

impl std::error::Error for AclParseError {}

//----------- Evaluation -------------------------------------------------------

/// The outcome of an ACL check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }
}

/// Decide whether `ip` may reach `target`.
///
/// Walks the enabled rules under the store's read lock.  Deny beats allow;
/// if any allow rule exists for the target, only matching clients pass;
/// with no rules at all the default is allow.
pub fn evaluate(
    store: &Store,
    target: Target,
    ip: IpAddr,
    country: Option<&str>,
    asn: Option<u32>,
) -> Decision {
    let metrics = store.metrics().clone();
    bump(&metrics.acl_checks);

    let decision = store.with_acl(|rules| {
        let mut matched_deny = false;
        let mut matched_allow = false;
        let mut allow_rule_exists = false;

        for rule in rules {
            if !rule.enabled {
                continue;
            }
            if rule.target != target && rule.target != Target::System {
                continue;
            }
            if rule.action == Action::Allow {
                allow_rule_exists = true;
            }
            if rule.kind.matches(ip, country, asn) {
                match rule.action {
                    Action::Allow => matched_allow = true,
                    Action::Deny => matched_deny = true,
                }
            }
        }

        if matched_deny {
            Decision::Deny
        } else if allow_rule_exists {
            if matched_allow {
                Decision::Allow
            } else {
                Decision::Deny
            }
        } else {
            Decision::Allow
        }
    });

    if decision == Decision::Deny {
        bump(&metrics.acl_denies);
    }
    decision
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::metrics::Metrics;
    use crate::store::{Store, StoreLimits};

    fn test_store() -> Store {
        Store::create(StoreLimits::default(), Arc::new(Metrics::new()))
    }

    fn rule(id: u32, kind: RuleKind, target: Target, action: Action) -> AclRule {
        AclRule {
            id,
            kind,
            target,
            action,
            enabled: true,
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn default_is_allow() {
        let store = test_store();
        assert_eq!(
            evaluate(&store, Target::Cache, ip("203.0.113.5"), None, None),
            Decision::Allow
        );
    }

    #[test]
    fn deny_wins_over_allow() {
        let store = test_store();
        store
            .set_acl(vec![
                rule(1, parse_cidr("203.0.113.0/24").unwrap(), Target::Cache, Action::Allow),
                rule(2, RuleKind::Ip(ip("203.0.113.5")), Target::Cache, Action::Deny),
            ])
            .unwrap();

        assert_eq!(
            evaluate(&store, Target::Cache, ip("203.0.113.5"), None, None),
            Decision::Deny
        );
        assert_eq!(
            evaluate(&store, Target::Cache, ip("203.0.113.6"), None, None),
            Decision::Allow
        );
    }

    #[test]
    fn allow_rules_make_an_allow_list() {
        let store = test_store();
        store
            .set_acl(vec![rule(
                1,
                parse_cidr("10.0.0.0/8").unwrap(),
                Target::Doh,
                Action::Allow,
            )])
            .unwrap();

        assert_eq!(
            evaluate(&store, Target::Doh, ip("10.1.2.3"), None, None),
            Decision::Allow
        );
        // Outside the allow list: denied.
        assert_eq!(
            evaluate(&store, Target::Doh, ip("192.0.2.1"), None, None),
            Decision::Deny
        );
        // Another target is not turned into an allow list by this rule.
        assert_eq!(
            evaluate(&store, Target::Cache, ip("192.0.2.1"), None, None),
            Decision::Allow
        );
    }

    #[test]
    fn system_rules_apply_everywhere() {
        let store = test_store();
        store
            .set_acl(vec![rule(
                1,
                RuleKind::Country("CN".into()),
                Target::System,
                Action::Deny,
            )])
            .unwrap();

        for target in [Target::Master, Target::Cache, Target::Doh] {
            assert_eq!(
                evaluate(&store, target, ip("203.0.113.1"), Some("cn"), None),
                Decision::Deny
            );
            assert_eq!(
                evaluate(&store, target, ip("203.0.113.1"), Some("NL"), None),
                Decision::Allow
            );
        }
    }

    #[test]
    fn asn_and_v6_cidr_predicates() {
        let store = test_store();
        store
            .set_acl(vec![
                rule(1, RuleKind::Asn(64512), Target::Cache, Action::Deny),
                rule(2, parse_cidr("2001:db8::/32").unwrap(), Target::Cache, Action::Deny),
            ])
            .unwrap();

        assert_eq!(
            evaluate(&store, Target::Cache, ip("203.0.113.1"), None, Some(64512)),
            Decision::Deny
        );
        assert_eq!(
            evaluate(&store, Target::Cache, ip("2001:db8:1::1"), None, None),
            Decision::Deny
        );
        assert_eq!(
            evaluate(&store, Target::Cache, ip("2001:db9::1"), None, Some(64513)),
            Decision::Allow
        );
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let store = test_store();
        store
            .set_acl(vec![AclRule {
                enabled: false,
                ..rule(1, RuleKind::Ip(ip("192.0.2.1")), Target::System, Action::Deny)
            }])
            .unwrap();
        assert_eq!(
            evaluate(&store, Target::Cache, ip("192.0.2.1"), None, None),
            Decision::Allow
        );
    }

    #[test]
    fn adding_deny_rules_is_monotone() {
        // Once denied, adding more deny rules can never flip the decision
        // back to allow.
        let store = test_store();
        let mut rules = vec![rule(
            1,
            RuleKind::Ip(ip("198.51.100.7")),
            Target::Cache,
            Action::Deny,
        )];
        store.set_acl(rules.clone()).unwrap();
        assert_eq!(
            evaluate(&store, Target::Cache, ip("198.51.100.7"), None, None),
            Decision::Deny
        );

        for extra in 0..8 {
            rules.push(rule(
                10 + extra,
                parse_cidr(&format!("10.{extra}.0.0/16")).unwrap(),
                Target::Cache,
                Action::Deny,
            ));
            store.set_acl(rules.clone()).unwrap();
            assert_eq!(
                evaluate(&store, Target::Cache, ip("198.51.100.7"), None, None),
                Decision::Deny
            );
        }
    }

    #[test]
    fn counters_track_checks_and_denies() {
        let store = test_store();
        store
            .set_acl(vec![rule(
                1,
                RuleKind::Ip(ip("192.0.2.1")),
                Target::Cache,
                Action::Deny,
            )])
            .unwrap();
        evaluate(&store, Target::Cache, ip("192.0.2.1"), None, None);
        evaluate(&store, Target::Cache, ip("192.0.2.2"), None, None);

        let stats = store.stats();
        assert_eq!(stats.acl_checks, 2);
        assert_eq!(stats.acl_denies, 1);
    }
}
