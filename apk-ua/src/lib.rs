//! User agent parser with built-in rules.
//!
//! Analytics events carry the raw `User-Agent` header of the invoking client. Sinks that report
//! on clients only need the browser and the platform family, so [`UserAgentCache`] resolves a
//! header into a [`ClientInfo`] once and keeps the most recently used results.
//!
//! # Performance
//!
//! Adding user agent parsing to your module will incur a latency penalty on first use, while the
//! rules compile. Call [`init_parser`] at startup to move that cost out of the request path.

use std::num::NonZeroUsize;
use std::sync::LazyLock;

use lru::LruCache;
use parking_lot::Mutex;
use uaparser::{Parser, UserAgentParser};

#[doc(inline)]
pub use uaparser::{OS, UserAgent};

/// The value reported for a browser or platform that could not be determined.
pub const UNKNOWN_VALUE: &str = "UNKNOWN";

/// Number of parsed user agents kept by default.
pub const DEFAULT_CACHE_SIZE: usize = 50;

/// The global [`UserAgentParser`] already configured with a user agent database.
///
/// For usage, see [`Parser`].
static UA_PARSER: LazyLock<Option<UserAgentParser>> = LazyLock::new(|| {
    let ua_regexes = include_bytes!("../uap-core/regexes.yaml");
    UserAgentParser::builder()
        .with_unicode_support(false)
        .build_from_bytes(ua_regexes)
        .ok()
});

/// Initializes the user agent parser.
///
/// This loads and compiles user agent patterns. The parser initializes on demand when using one
/// of the parse methods; this function forces initialization at a convenient point.
pub fn init_parser() {
    LazyLock::force(&UA_PARSER);
}

/// Returns the family and version of a user agent client.
///
/// Defaults to an empty user agent.
pub fn parse_user_agent(user_agent: &str) -> UserAgent<'_> {
    match UA_PARSER.as_ref() {
        Some(parser) => parser.parse_user_agent(user_agent),
        None => UserAgent::default(),
    }
}

/// Returns the family and version of the operating system of the requesting client.
///
/// Defaults to an empty operating system.
pub fn parse_os(user_agent: &str) -> OS<'_> {
    match UA_PARSER.as_ref() {
        Some(parser) => parser.parse_os(user_agent),
        None => OS::default(),
    }
}

/// Browser and platform families of one client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientInfo {
    /// The browser family, for example `Chrome` or `Mobile Safari`.
    pub browser: String,
    /// The operating system family, for example `Windows` or `iOS`.
    pub platform: String,
}

impl ClientInfo {
    /// Parses the header without consulting a cache.
    pub fn parse(header: &str) -> Self {
        if header.trim().is_empty() {
            return Self::unknown();
        }

        Self {
            browser: or_unknown(&parse_user_agent(header).family),
            platform: or_unknown(&parse_os(header).family),
        }
    }

    /// Info for a client that sent no user agent.
    pub fn unknown() -> Self {
        Self {
            browser: UNKNOWN_VALUE.to_owned(),
            platform: UNKNOWN_VALUE.to_owned(),
        }
    }
}

fn or_unknown(family: &str) -> String {
    if family.is_empty() {
        UNKNOWN_VALUE.to_owned()
    } else {
        family.to_owned()
    }
}

/// A bounded cache from raw user agent headers to their parsed [`ClientInfo`].
///
/// Once full, the least recently used entry is evicted. The cache is internally synchronized and
/// meant to be shared between the workers of one reporter.
#[derive(Debug)]
pub struct UserAgentCache {
    entries: Mutex<LruCache<String, ClientInfo>>,
}

impl UserAgentCache {
    /// Creates a cache holding at most `capacity` entries. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the client info for the given header, parsing it on a cache miss.
    pub fn lookup(&self, header: &str) -> ClientInfo {
        if let Some(info) = self.entries.lock().get(header) {
            return info.clone();
        }

        // Parse outside of the lock, concurrent misses for the same header are harmless.
        let info = ClientInfo::parse(header);
        self.entries.lock().put(header.to_owned(), info.clone());
        info
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if nothing has been cached yet.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Returns `true` if the header is cached, without touching its recency.
    pub fn contains(&self, header: &str) -> bool {
        self.entries.lock().contains(header)
    }
}

impl Default for UserAgentCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}
