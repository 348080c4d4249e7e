//! # URI Prefix Dictionary
//!
//! Most URIs in a knowledge base share a handful of long prefixes
//! (`http://example.org/resource/...`). The resource hash exploits that with
//! a bounded dictionary of at most 255 learned prefixes, each assigned a
//! one-byte code; an entry then stores the code plus the suffix instead of
//! the whole URI, which keeps many URIs inline that would otherwise spill to
//! the lexical file.
//!
//! Two structures cooperate here:
//!
//! - [`PrefixTrie`]: a byte trie over a fixed node pool. With codes attached
//!   it answers longest-prefix matches; without, it acts as the *learner*,
//!   counting how often each path is walked. When the learner's pool fills
//!   up, its most profitable divergence points are harvested as new
//!   dictionary entries and the learner starts over.
//! - [`PrefixTable`]: the registered prefixes, their codes, and the matching
//!   trie, rebuilt from the on-disk prefix list whenever that list changes.
//!
//! Code 0 is reserved to mean "no prefix" so a zeroed entry byte can never
//! alias a real dictionary slot.

use eyre::{ensure, Result};
use hashbrown::HashMap;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Dictionary capacity including the reserved code 0.
pub const MAX_PREFIXES: usize = 256;

/// Width of a prefix list record; comfortably wider than any real prefix so
/// the list shares the fixed-width record machinery.
pub const PREFIX_LINE_WIDTH: usize = 512;

/// Longest prefix the line format can hold, NUL terminator included.
pub const MAX_PREFIX_LEN: usize = PREFIX_LINE_WIDTH - 5;

/// Node budget of a learner trie. Small on purpose: a full learner is what
/// triggers harvesting, and a batch of a few dozen URIs with a shared prefix
/// has to be enough to fill it.
pub const LEARNER_NODES: usize = 256;

/// Node budget of the matching trie, sized for a full dictionary.
pub const MATCHER_NODES: usize = 16384;

/// Bytes of a string the learner will look at.
const LEARN_DEPTH: usize = 64;

/// A harvested prefix has to be at least this long to be worth a code.
const MIN_CANDIDATE_LEN: usize = 8;

/// ...and seen at least this many times.
const MIN_CANDIDATE_HITS: u32 = 4;

/// One record of the prefix list file: `{code, NUL-padded prefix}`.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PrefixLine {
    pub code: U32,
    pub prefix: [u8; 508],
}

const _: () = assert!(std::mem::size_of::<PrefixLine>() == PREFIX_LINE_WIDTH);

impl PrefixLine {
    pub fn new(code: u8, prefix: &str) -> Self {
        let mut line = Self {
            code: U32::new(code as u32),
            prefix: [0; 508],
        };
        line.prefix[..prefix.len()].copy_from_slice(prefix.as_bytes());
        line
    }

    pub fn prefix_str(&self) -> Result<&str> {
        let end = self
            .prefix
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.prefix.len());
        std::str::from_utf8(&self.prefix[..end])
            .map_err(|_| eyre::eyre!("prefix list record is not valid UTF-8"))
    }
}

#[derive(Debug, Default)]
struct Node {
    children: HashMap<u8, u32>,
    /// Dictionary code terminating at this node, 0 if none.
    code: u8,
    /// How many learned strings walked through this node.
    hits: u32,
}

/// A bounded byte trie used for both prefix matching and online learning.
#[derive(Debug)]
pub struct PrefixTrie {
    nodes: Vec<Node>,
    capacity: usize,
}

/// A prefix proposed by the learner, scored by bytes it would save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub prefix: String,
    pub score: u64,
}

impl PrefixTrie {
    pub fn new(capacity: usize) -> Self {
        let mut nodes = Vec::with_capacity(64.min(capacity));
        nodes.push(Node::default());
        Self { nodes, capacity }
    }

    fn child(&mut self, node: u32, byte: u8) -> Option<u32> {
        if let Some(&c) = self.nodes[node as usize].children.get(&byte) {
            return Some(c);
        }
        if self.nodes.len() >= self.capacity {
            return None;
        }
        let c = self.nodes.len() as u32;
        self.nodes.push(Node::default());
        self.nodes[node as usize].children.insert(byte, c);
        Some(c)
    }

    /// Registers `prefix` under `code` for matching.
    pub fn add_code(&mut self, prefix: &str, code: u8) -> Result<()> {
        let mut node = 0;
        for &b in prefix.as_bytes() {
            node = self
                .child(node, b)
                .ok_or_else(|| eyre::eyre!("prefix trie node pool exhausted"))?;
        }
        self.nodes[node as usize].code = code;
        Ok(())
    }

    /// Longest registered prefix of `lex`, as `(code, prefix length)`.
    pub fn longest_match(&self, lex: &str) -> Option<(u8, usize)> {
        let mut node = 0u32;
        let mut best = None;
        for (i, &b) in lex.as_bytes().iter().enumerate() {
            match self.nodes[node as usize].children.get(&b) {
                Some(&c) => node = c,
                None => break,
            }
            let code = self.nodes[node as usize].code;
            if code != 0 {
                best = Some((code, i + 1));
            }
        }
        best
    }

    /// Records a string in the learner. Returns `false` when the node pool
    /// is exhausted, which is the caller's cue to harvest and reset.
    pub fn add_string(&mut self, lex: &str) -> bool {
        let mut node = 0;
        for &b in lex.as_bytes().iter().take(LEARN_DEPTH) {
            match self.child(node, b) {
                Some(c) => node = c,
                None => return false,
            }
            self.nodes[node as usize].hits += 1;
        }
        true
    }

    /// Harvests up to `max` candidate prefixes, best score first. A
    /// candidate is a divergence point: a node where the walked strings stop
    /// agreeing, deep enough and busy enough to pay for a dictionary slot.
    pub fn candidates(&self, max: usize) -> Vec<Candidate> {
        let mut out = Vec::new();
        let mut path = Vec::with_capacity(LEARN_DEPTH);
        self.collect(0, &mut path, &mut out);
        out.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.prefix.cmp(&b.prefix)));
        out.truncate(max);
        out
    }

    fn collect(&self, node: u32, path: &mut Vec<u8>, out: &mut Vec<Candidate>) {
        let n = &self.nodes[node as usize];
        if path.len() >= MIN_CANDIDATE_LEN && n.hits >= MIN_CANDIDATE_HITS {
            let child_max = n
                .children
                .values()
                .map(|&c| self.nodes[c as usize].hits)
                .max()
                .unwrap_or(0);
            // straight chain segments (one child carrying every hit) are not
            // boundaries; the divergence point further down will score better
            if child_max < n.hits {
                if let Ok(prefix) = std::str::from_utf8(path) {
                    out.push(Candidate {
                        prefix: prefix.to_owned(),
                        score: n.hits as u64 * path.len() as u64,
                    });
                }
            }
        }
        for (&b, &c) in &n.children {
            path.push(b);
            self.collect(c, path, out);
            path.pop();
        }
    }
}

/// The registered prefix dictionary: code-indexed strings plus the matching
/// trie. Codes run from 1; slot 0 is the reserved "no prefix".
#[derive(Debug)]
pub struct PrefixTable {
    strings: Vec<String>,
    trie: PrefixTrie,
}

impl PrefixTable {
    pub fn new() -> Self {
        Self {
            strings: vec![String::new()],
            trie: PrefixTrie::new(MATCHER_NODES),
        }
    }

    /// Number of registered prefixes (reserved slot excluded).
    pub fn len(&self) -> usize {
        self.strings.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.strings.len() >= MAX_PREFIXES
    }

    /// The prefix registered under `code`, if any.
    pub fn get(&self, code: u8) -> Option<&str> {
        if code == 0 {
            return None;
        }
        self.strings.get(code as usize).map(String::as_str)
    }

    pub fn longest_match(&self, lex: &str) -> Option<(u8, usize)> {
        self.trie.longest_match(lex)
    }

    /// Registers a freshly learned prefix under the next code.
    pub fn register(&mut self, prefix: &str) -> Result<u8> {
        ensure!(!self.is_full(), "prefix dictionary is full");
        let code = self.strings.len() as u8;
        self.insert(code, prefix)?;
        Ok(code)
    }

    /// Registers a prefix under a known code, as read back from the prefix
    /// list. Codes must arrive in file order, i.e. densely from 1.
    pub fn insert(&mut self, code: u8, prefix: &str) -> Result<()> {
        ensure!(
            code as usize == self.strings.len() && !self.is_full(),
            "prefix code {} out of sequence (expected {})",
            code,
            self.strings.len()
        );
        ensure!(
            !prefix.is_empty() && prefix.len() <= MAX_PREFIX_LEN,
            "prefix of {} bytes does not fit a dictionary record",
            prefix.len()
        );
        self.trie.add_code(prefix, code)?;
        self.strings.push(prefix.to_owned());
        Ok(())
    }
}

impl Default for PrefixTable {
    fn default() -> Self {
        Self::new()
    }
}
