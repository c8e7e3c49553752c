//! Purpose: Stable identifiers for the mutating commands the queue persists.
//! Exports: `CommandKind`, `Arity`.
//! Role: One lookup table shared by pack and unpack; tags are what lands on disk.
//! Invariants: Tags are never renumbered or reused; new commands get new tags.
//! Invariants: Argument counts exclude the command name and include the key.
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CommandKind {
    Set,
    MSet,
    ExpireAt,
    LPop,
    RPop,
    LPushX,
    RPushX,
    LPush,
    RPush,
    ZAdd,
    Incr,
    IncrBy,
    ZIncrBy,
    ZRem,
    ZRemRangeByScore,
    ZRemRangeByRank,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
    /// Key/value pairs: an even count of at least the given size.
    Pairs(usize),
    /// Key followed by pairs: an odd count of at least the given size.
    KeyAndPairs(usize),
}

impl Arity {
    pub fn accepts(self, argc: usize) -> bool {
        match self {
            Arity::Exactly(n) => argc == n,
            Arity::AtLeast(n) => argc >= n,
            Arity::Pairs(min) => argc >= min && argc % 2 == 0,
            Arity::KeyAndPairs(min) => argc >= min && argc % 2 == 1,
        }
    }
}

#[derive(Clone, Copy)]
struct CommandSpec {
    tag: u32,
    name: &'static str,
    arity: Arity,
}

const ALL: [CommandKind; 16] = [
    CommandKind::Set,
    CommandKind::MSet,
    CommandKind::ExpireAt,
    CommandKind::LPop,
    CommandKind::RPop,
    CommandKind::LPushX,
    CommandKind::RPushX,
    CommandKind::LPush,
    CommandKind::RPush,
    CommandKind::ZAdd,
    CommandKind::Incr,
    CommandKind::IncrBy,
    CommandKind::ZIncrBy,
    CommandKind::ZRem,
    CommandKind::ZRemRangeByScore,
    CommandKind::ZRemRangeByRank,
];

const fn spec(tag: u32, name: &'static str, arity: Arity) -> CommandSpec {
    CommandSpec { tag, name, arity }
}

impl CommandKind {
    fn spec(self) -> CommandSpec {
        match self {
            CommandKind::Set => spec(1, "set", Arity::Exactly(2)),
            CommandKind::MSet => spec(2, "mset", Arity::Pairs(2)),
            CommandKind::ExpireAt => spec(3, "expireat", Arity::Exactly(2)),
            CommandKind::LPop => spec(4, "lpop", Arity::Exactly(1)),
            CommandKind::RPop => spec(5, "rpop", Arity::Exactly(1)),
            CommandKind::LPushX => spec(6, "lpushx", Arity::Exactly(2)),
            CommandKind::RPushX => spec(7, "rpushx", Arity::Exactly(2)),
            CommandKind::LPush => spec(8, "lpush", Arity::AtLeast(2)),
            CommandKind::RPush => spec(9, "rpush", Arity::AtLeast(2)),
            CommandKind::ZAdd => spec(10, "zadd", Arity::KeyAndPairs(3)),
            CommandKind::Incr => spec(11, "incr", Arity::Exactly(1)),
            CommandKind::IncrBy => spec(12, "incrby", Arity::Exactly(2)),
            CommandKind::ZIncrBy => spec(13, "zincrby", Arity::Exactly(3)),
            CommandKind::ZRem => spec(14, "zrem", Arity::AtLeast(2)),
            CommandKind::ZRemRangeByScore => spec(15, "zremrangebyscore", Arity::Exactly(3)),
            CommandKind::ZRemRangeByRank => spec(16, "zremrangebyrank", Arity::Exactly(3)),
        }
    }

    pub fn all() -> impl Iterator<Item = CommandKind> {
        ALL.into_iter()
    }

    pub fn tag(self) -> u32 {
        self.spec().tag
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        Self::all().find(|kind| kind.tag() == tag)
    }

    pub fn name(self) -> &'static str {
        self.spec().name
    }

    /// Case-insensitive lookup by command name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().find(|kind| kind.name().eq_ignore_ascii_case(name))
    }

    pub fn arity(self) -> Arity {
        self.spec().arity
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
