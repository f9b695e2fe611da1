//! Typed topic keys.
//!
//! A topic key is parsed once at the boundary into [`Topic`]; everything past
//! that point works with the variant, never with the raw string.
//!
//! Key shapes (`<sid>` is a community/server id):
//!
//! | category          | scoped                                     | global           |
//! |-------------------|--------------------------------------------|------------------|
//! | person            | `server:<sid>:user:<uid>`                  | `user:<uid>`     |
//! | channel           | `server:<sid>:channel:<cid>`               |                  |
//! | thread            | `server:<sid>:thread:<tid>`                |                  |
//! | role              | `server:<sid>:role:<rid>`                  |                  |
//! | pair              | `server:<sid>:dyad:<a>:<b>`                | `dyad:<a>:<b>`   |
//! | person-in-channel | `server:<sid>:user:<uid>:channel:<cid>`    |                  |
//! | pair-in-channel   | `server:<sid>:dyad:<a>:<b>:channel:<cid>`  |                  |
//! | subject           | `server:<sid>:subject:<name>`              | `subject:<name>` |
//! | reaction-symbol   | `server:<sid>:emoji:<name>`                | `emoji:<name>`   |
//! | self              |                                            | `self:<facet>`   |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::error::TopicError;

/// Closed set of topic categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicCategory {
    Person,
    Channel,
    Thread,
    Role,
    Pair,
    PersonInChannel,
    PairInChannel,
    Subject,
    ReactionSymbol,
    #[serde(rename = "self")]
    SelfFacet,
}

impl TopicCategory {
    pub const ALL: [TopicCategory; 10] = [
        TopicCategory::Person,
        TopicCategory::Channel,
        TopicCategory::Thread,
        TopicCategory::Role,
        TopicCategory::Pair,
        TopicCategory::PersonInChannel,
        TopicCategory::PairInChannel,
        TopicCategory::Subject,
        TopicCategory::ReactionSymbol,
        TopicCategory::SelfFacet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Channel => "channel",
            Self::Thread => "thread",
            Self::Role => "role",
            Self::Pair => "pair",
            Self::PersonInChannel => "person_in_channel",
            Self::PairInChannel => "pair_in_channel",
            Self::Subject => "subject",
            Self::ReactionSymbol => "reaction_symbol",
            Self::SelfFacet => "self",
        }
    }
}

impl fmt::Display for TopicCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TopicCategory {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| TopicError::UnknownCategory(s.to_string()))
    }
}

/// Partition of topics that share one slice of a reflection budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetGroup {
    /// People and pairs of people.
    Social,
    /// Places: channels, threads, roles and presence within channels.
    Spaces,
    /// Subjects and reaction symbols.
    Semantic,
    /// Cross-community topics.
    Global,
    /// The agent's own facets.
    #[serde(rename = "self")]
    SelfFacet,
}

impl BudgetGroup {
    /// Groups that split a per-scope budget.
    pub const SCOPED: [BudgetGroup; 3] = [
        BudgetGroup::Social,
        BudgetGroup::Spaces,
        BudgetGroup::Semantic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Social => "social",
            Self::Spaces => "spaces",
            Self::Semantic => "semantic",
            Self::Global => "global",
            Self::SelfFacet => "self",
        }
    }
}

impl fmt::Display for BudgetGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How two topics are related, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// Sibling within the same scope.
    SameScope,
    /// A scoped topic and its global counterpart.
    CrossScope,
}

/// A parsed topic key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    Person {
        server: Option<String>,
        user: String,
    },
    Channel {
        server: String,
        channel: String,
    },
    Thread {
        server: String,
        thread: String,
    },
    Role {
        server: String,
        role: String,
    },
    /// Members are kept sorted; `a < b`.
    Pair {
        server: Option<String>,
        a: String,
        b: String,
    },
    PersonInChannel {
        server: String,
        user: String,
        channel: String,
    },
    PairInChannel {
        server: String,
        a: String,
        b: String,
        channel: String,
    },
    Subject {
        server: Option<String>,
        name: String,
    },
    ReactionSymbol {
        server: Option<String>,
        name: String,
    },
    SelfFacet {
        facet: String,
    },
}

fn ident(kind: &'static str, value: &str) -> Result<String, TopicError> {
    if value.is_empty() {
        return Err(TopicError::EmptyIdentifier(kind));
    }
    if value.contains(':') {
        return Err(TopicError::InvalidIdentifier {
            kind,
            value: value.to_string(),
        });
    }
    Ok(value.to_string())
}

fn sorted_pair(a: &str, b: &str) -> Result<(String, String), TopicError> {
    let a = ident("user", a)?;
    let b = ident("user", b)?;
    match a.cmp(&b) {
        std::cmp::Ordering::Less => Ok((a, b)),
        std::cmp::Ordering::Greater => Ok((b, a)),
        std::cmp::Ordering::Equal => Err(TopicError::SelfPair(a)),
    }
}

impl Topic {
    // -- constructors ------------------------------------------------------

    pub fn person(server: Option<&str>, user: &str) -> Result<Self, TopicError> {
        Ok(Self::Person {
            server: server.map(|s| ident("server", s)).transpose()?,
            user: ident("user", user)?,
        })
    }

    pub fn channel(server: &str, channel: &str) -> Result<Self, TopicError> {
        Ok(Self::Channel {
            server: ident("server", server)?,
            channel: ident("channel", channel)?,
        })
    }

    pub fn thread(server: &str, thread: &str) -> Result<Self, TopicError> {
        Ok(Self::Thread {
            server: ident("server", server)?,
            thread: ident("thread", thread)?,
        })
    }

    pub fn role(server: &str, role: &str) -> Result<Self, TopicError> {
        Ok(Self::Role {
            server: ident("server", server)?,
            role: ident("role", role)?,
        })
    }

    /// Members are sorted, so `pair(s, x, y) == pair(s, y, x)`.
    pub fn pair(server: Option<&str>, a: &str, b: &str) -> Result<Self, TopicError> {
        let (a, b) = sorted_pair(a, b)?;
        Ok(Self::Pair {
            server: server.map(|s| ident("server", s)).transpose()?,
            a,
            b,
        })
    }

    pub fn person_in_channel(server: &str, user: &str, channel: &str) -> Result<Self, TopicError> {
        Ok(Self::PersonInChannel {
            server: ident("server", server)?,
            user: ident("user", user)?,
            channel: ident("channel", channel)?,
        })
    }

    pub fn pair_in_channel(
        server: &str,
        a: &str,
        b: &str,
        channel: &str,
    ) -> Result<Self, TopicError> {
        let (a, b) = sorted_pair(a, b)?;
        Ok(Self::PairInChannel {
            server: ident("server", server)?,
            a,
            b,
            channel: ident("channel", channel)?,
        })
    }

    pub fn subject(server: Option<&str>, name: &str) -> Result<Self, TopicError> {
        Ok(Self::Subject {
            server: server.map(|s| ident("server", s)).transpose()?,
            name: ident("subject", name)?,
        })
    }

    pub fn reaction_symbol(server: Option<&str>, name: &str) -> Result<Self, TopicError> {
        Ok(Self::ReactionSymbol {
            server: server.map(|s| ident("server", s)).transpose()?,
            name: ident("emoji", name)?,
        })
    }

    pub fn self_facet(facet: &str) -> Result<Self, TopicError> {
        Ok(Self::SelfFacet {
            facet: ident("self", facet)?,
        })
    }

    // -- parsing -----------------------------------------------------------

    /// Parse a key string. Every category has exactly one accepted shape.
    pub fn parse(key: &str) -> Result<Self, TopicError> {
        if key.is_empty() {
            return Err(TopicError::Empty);
        }
        let parts: Vec<&str> = key.split(':').collect();
        let malformed = || TopicError::Malformed(key.to_string());

        let (server, rest) = match parts.as_slice() {
            ["server", sid, rest @ ..] => (Some(*sid), rest),
            rest => (None, rest),
        };

        let topic = match (server, rest) {
            (s, ["user", uid]) => Self::person(s, uid)?,
            (Some(s), ["user", uid, "channel", cid]) => Self::person_in_channel(s, uid, cid)?,
            (Some(s), ["channel", cid]) => Self::channel(s, cid)?,
            (Some(s), ["thread", tid]) => Self::thread(s, tid)?,
            (Some(s), ["role", rid]) => Self::role(s, rid)?,
            (s, ["dyad", a, b]) => {
                if a >= b {
                    return Err(if a == b {
                        TopicError::SelfPair(a.to_string())
                    } else {
                        TopicError::UnsortedPair(key.to_string())
                    });
                }
                Self::pair(s, a, b)?
            }
            (Some(s), ["dyad", a, b, "channel", cid]) => {
                if a >= b {
                    return Err(if a == b {
                        TopicError::SelfPair(a.to_string())
                    } else {
                        TopicError::UnsortedPair(key.to_string())
                    });
                }
                Self::pair_in_channel(s, a, b, cid)?
            }
            (s, ["subject", name]) => Self::subject(s, name)?,
            (s, ["emoji", name]) => Self::reaction_symbol(s, name)?,
            (None, ["self", facet]) => Self::self_facet(facet)?,
            _ => return Err(malformed()),
        };
        Ok(topic)
    }

    /// Canonical key string.
    pub fn key(&self) -> String {
        self.to_string()
    }

    // -- classification ----------------------------------------------------

    pub fn category(&self) -> TopicCategory {
        match self {
            Self::Person { .. } => TopicCategory::Person,
            Self::Channel { .. } => TopicCategory::Channel,
            Self::Thread { .. } => TopicCategory::Thread,
            Self::Role { .. } => TopicCategory::Role,
            Self::Pair { .. } => TopicCategory::Pair,
            Self::PersonInChannel { .. } => TopicCategory::PersonInChannel,
            Self::PairInChannel { .. } => TopicCategory::PairInChannel,
            Self::Subject { .. } => TopicCategory::Subject,
            Self::ReactionSymbol { .. } => TopicCategory::ReactionSymbol,
            Self::SelfFacet { .. } => TopicCategory::SelfFacet,
        }
    }

    /// The community this topic belongs to, `None` for global and self topics.
    pub fn scope(&self) -> Option<&str> {
        match self {
            Self::Person { server, .. }
            | Self::Pair { server, .. }
            | Self::Subject { server, .. }
            | Self::ReactionSymbol { server, .. } => server.as_deref(),
            Self::Channel { server, .. }
            | Self::Thread { server, .. }
            | Self::Role { server, .. }
            | Self::PersonInChannel { server, .. }
            | Self::PairInChannel { server, .. } => Some(server),
            Self::SelfFacet { .. } => None,
        }
    }

    /// Cross-community topic (not scoped, not self).
    pub fn is_global(&self) -> bool {
        self.scope().is_none() && !self.is_self()
    }

    pub fn is_self(&self) -> bool {
        matches!(self, Self::SelfFacet { .. })
    }

    pub fn budget_group(&self) -> BudgetGroup {
        if self.is_self() {
            return BudgetGroup::SelfFacet;
        }
        if self.is_global() {
            return BudgetGroup::Global;
        }
        match self.category() {
            TopicCategory::Person | TopicCategory::Pair => BudgetGroup::Social,
            TopicCategory::Subject | TopicCategory::ReactionSymbol => BudgetGroup::Semantic,
            _ => BudgetGroup::Spaces,
        }
    }

    /// Global counterpart of a scoped person, pair, subject or reaction symbol.
    pub fn global_counterpart(&self) -> Option<Topic> {
        match self {
            Self::Person {
                server: Some(_),
                user,
            } => Some(Self::Person {
                server: None,
                user: user.clone(),
            }),
            Self::Pair {
                server: Some(_),
                a,
                b,
            } => Some(Self::Pair {
                server: None,
                a: a.clone(),
                b: b.clone(),
            }),
            Self::Subject {
                server: Some(_),
                name,
            } => Some(Self::Subject {
                server: None,
                name: name.clone(),
            }),
            Self::ReactionSymbol {
                server: Some(_),
                name,
            } => Some(Self::ReactionSymbol {
                server: None,
                name: name.clone(),
            }),
            _ => None,
        }
    }

    /// Same topic re-homed in `server`; `None` for topics that have no global form.
    pub fn in_scope(&self, server: &str) -> Option<Topic> {
        let server = Some(server.to_string());
        match self {
            Self::Person { server: None, user } => Some(Self::Person {
                server,
                user: user.clone(),
            }),
            Self::Pair { server: None, a, b } => Some(Self::Pair {
                server,
                a: a.clone(),
                b: b.clone(),
            }),
            Self::Subject { server: None, name } => Some(Self::Subject {
                server,
                name: name.clone(),
            }),
            Self::ReactionSymbol { server: None, name } => Some(Self::ReactionSymbol {
                server,
                name: name.clone(),
            }),
            _ => None,
        }
    }

    /// Whether `user` participates in this topic.
    pub fn involves_user(&self, user: &str) -> bool {
        match self {
            Self::Person { user: u, .. } | Self::PersonInChannel { user: u, .. } => u == user,
            Self::Pair { a, b, .. } | Self::PairInChannel { a, b, .. } => a == user || b == user,
            _ => false,
        }
    }

    /// One-hop relation between two topics. Symmetric.
    pub fn relation_to(&self, other: &Topic) -> Option<Relation> {
        if self == other || self.is_self() || other.is_self() {
            return None;
        }
        if self.global_counterpart().as_ref() == Some(other)
            || other.global_counterpart().as_ref() == Some(self)
        {
            return Some(Relation::CrossScope);
        }
        if self.contains(other) || other.contains(self) {
            return Some(Relation::SameScope);
        }
        None
    }

    /// Directional half of the same-scope relation: `self` is the wider topic.
    fn contains(&self, other: &Topic) -> bool {
        match (self, other) {
            (
                Self::Person { server: s1, user },
                Self::Pair {
                    server: s2, a, b, ..
                },
            ) => s1 == s2 && (user == a || user == b),
            (
                Self::Person {
                    server: Some(s1),
                    user: u1,
                },
                Self::PersonInChannel {
                    server: s2,
                    user: u2,
                    ..
                },
            ) => s1 == s2 && u1 == u2,
            (
                Self::Channel {
                    server: s1,
                    channel: c1,
                },
                Self::PersonInChannel {
                    server: s2,
                    channel: c2,
                    ..
                },
            )
            | (
                Self::Channel {
                    server: s1,
                    channel: c1,
                },
                Self::PairInChannel {
                    server: s2,
                    channel: c2,
                    ..
                },
            ) => s1 == s2 && c1 == c2,
            (
                Self::Pair {
                    server: Some(s1),
                    a: a1,
                    b: b1,
                },
                Self::PairInChannel {
                    server: s2,
                    a: a2,
                    b: b2,
                    ..
                },
            ) => s1 == s2 && a1 == a2 && b1 == b2,
            _ => false,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = |f: &mut fmt::Formatter<'_>, server: &Option<String>| match server {
            Some(s) => write!(f, "server:{s}:"),
            None => Ok(()),
        };
        match self {
            Self::Person { server, user } => {
                scope(f, server)?;
                write!(f, "user:{user}")
            }
            Self::Channel { server, channel } => write!(f, "server:{server}:channel:{channel}"),
            Self::Thread { server, thread } => write!(f, "server:{server}:thread:{thread}"),
            Self::Role { server, role } => write!(f, "server:{server}:role:{role}"),
            Self::Pair { server, a, b } => {
                scope(f, server)?;
                write!(f, "dyad:{a}:{b}")
            }
            Self::PersonInChannel {
                server,
                user,
                channel,
            } => write!(f, "server:{server}:user:{user}:channel:{channel}"),
            Self::PairInChannel {
                server,
                a,
                b,
                channel,
            } => write!(f, "server:{server}:dyad:{a}:{b}:channel:{channel}"),
            Self::Subject { server, name } => {
                scope(f, server)?;
                write!(f, "subject:{name}")
            }
            Self::ReactionSymbol { server, name } => {
                scope(f, server)?;
                write!(f, "emoji:{name}")
            }
            Self::SelfFacet { facet } => write!(f, "self:{facet}"),
        }
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let key = String::deserialize(deserializer)?;
        Topic::parse(&key).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_shape_round_trips() {
        let keys = [
            "server:g1:user:u1",
            "user:u1",
            "server:g1:channel:c1",
            "server:g1:thread:t1",
            "server:g1:role:r1",
            "server:g1:dyad:u1:u2",
            "dyad:u1:u2",
            "server:g1:user:u1:channel:c1",
            "server:g1:dyad:u1:u2:channel:c1",
            "server:g1:subject:rust",
            "subject:rust",
            "server:g1:emoji:wave",
            "emoji:wave",
            "self:voice",
        ];
        for key in keys {
            let topic = Topic::parse(key).unwrap();
            assert_eq!(topic.key(), key);
        }
    }

    #[test]
    fn key_determines_category_and_scope() {
        let t = Topic::parse("server:g1:dyad:u1:u2:channel:c9").unwrap();
        assert_eq!(t.category(), TopicCategory::PairInChannel);
        assert_eq!(t.scope(), Some("g1"));
        assert!(!t.is_global());

        let g = Topic::parse("subject:rust").unwrap();
        assert!(g.is_global());
        assert_eq!(g.budget_group(), BudgetGroup::Global);

        let s = Topic::parse("self:voice").unwrap();
        assert!(!s.is_global());
        assert_eq!(s.budget_group(), BudgetGroup::SelfFacet);
    }

    #[test]
    fn malformed_keys_are_rejected() {
        for key in [
            "",
            "user:",
            "server:g1",
            "channel:c1",
            "server:g1:self:x",
            "server:g1:user:u1:thread:t1",
            "dyad:u1:u1",
            "dyad:u2:u1",
            "planet:mars",
        ] {
            assert!(Topic::parse(key).is_err(), "accepted {key:?}");
        }
    }

    #[test]
    fn pair_constructor_sorts_members() {
        let p = Topic::pair(Some("g1"), "zed", "amy").unwrap();
        assert_eq!(p.key(), "server:g1:dyad:amy:zed");
        assert_eq!(p, Topic::pair(Some("g1"), "amy", "zed").unwrap());
        assert!(matches!(
            Topic::pair(None, "amy", "amy"),
            Err(TopicError::SelfPair(_))
        ));
    }

    #[test]
    fn identifiers_cannot_contain_separator() {
        assert!(Topic::person(Some("g:1"), "u1").is_err());
        assert!(Topic::subject(None, "").is_err());
    }

    #[test]
    fn relations_are_one_hop_and_symmetric() {
        let person = Topic::parse("server:g1:user:u1").unwrap();
        let pair = Topic::parse("server:g1:dyad:u1:u2").unwrap();
        let pic = Topic::parse("server:g1:user:u1:channel:c1").unwrap();
        let channel = Topic::parse("server:g1:channel:c1").unwrap();
        let global = Topic::parse("user:u1").unwrap();
        let other_scope_pair = Topic::parse("server:g2:dyad:u1:u2").unwrap();

        assert_eq!(person.relation_to(&pair), Some(Relation::SameScope));
        assert_eq!(pair.relation_to(&person), Some(Relation::SameScope));
        assert_eq!(person.relation_to(&pic), Some(Relation::SameScope));
        assert_eq!(channel.relation_to(&pic), Some(Relation::SameScope));
        assert_eq!(person.relation_to(&global), Some(Relation::CrossScope));
        assert_eq!(global.relation_to(&person), Some(Relation::CrossScope));

        // two hops away
        assert_eq!(pair.relation_to(&channel), None);
        assert_eq!(person.relation_to(&other_scope_pair), None);
    }

    #[test]
    fn global_pair_relates_to_global_persons() {
        let pair = Topic::parse("dyad:u1:u2").unwrap();
        let u1 = Topic::parse("user:u1").unwrap();
        let u3 = Topic::parse("user:u3").unwrap();
        assert_eq!(pair.relation_to(&u1), Some(Relation::SameScope));
        assert_eq!(pair.relation_to(&u3), None);
    }

    #[test]
    fn self_topics_have_no_relatives() {
        let me = Topic::parse("self:voice").unwrap();
        let other = Topic::parse("self:mood").unwrap();
        assert_eq!(me.relation_to(&other), None);
    }

    #[test]
    fn counterparts() {
        let scoped = Topic::parse("server:g1:emoji:wave").unwrap();
        let global = scoped.global_counterpart().unwrap();
        assert_eq!(global.key(), "emoji:wave");
        assert_eq!(global.in_scope("g1"), Some(scoped));
        assert!(Topic::parse("server:g1:channel:c1")
            .unwrap()
            .global_counterpart()
            .is_none());
    }

    #[test]
    fn serde_uses_key_string() {
        let t = Topic::parse("server:g1:user:u1").unwrap();
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, "\"server:g1:user:u1\"");
        let back: Topic = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
        assert!(serde_json::from_str::<Topic>("\"nonsense\"").is_err());
    }
}
