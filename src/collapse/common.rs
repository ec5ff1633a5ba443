use std::io;

use ahash::AHashMap;

const CAPACITY_HASHMAP: usize = 512;

/// Folded stacks along with their accumulated weight.
///
/// Keys are unique; adding to an existing key accumulates into its weight.
#[derive(Clone, Debug, Default)]
pub(crate) struct Occurrences {
    map: AHashMap<String, u64>,
}

impl Occurrences {
    pub(crate) fn new() -> Self {
        Occurrences {
            map: AHashMap::with_capacity(CAPACITY_HASHMAP),
        }
    }

    /// Inserts a key-count pair into the map if the key does not already exist.
    /// If the key does already exist, adds count to the current value of the
    /// existing key.
    pub(crate) fn insert_or_add(&mut self, key: String, count: u64) {
        let value = self.map.entry(key).or_insert(0);
        *value = value.saturating_add(count);
    }

    pub(crate) fn get(&self, key: &str) -> Option<u64> {
        self.map.get(key).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Writes one `<stack> <count>` line per entry.
    ///
    /// Lines are sorted so the output is stable across runs, even though nothing downstream
    /// relies on the order.
    pub(crate) fn write<W>(&self, mut writer: W) -> io::Result<()>
    where
        W: io::Write,
    {
        let mut contents: Vec<_> = self.map.iter().collect();
        contents.sort();
        let mut count_buf = itoa::Buffer::new();
        for (key, value) in contents {
            writer.write_all(key.as_bytes())?;
            writer.write_all(b" ")?;
            writer.write_all(count_buf.format(*value).as_bytes())?;
            writer.write_all(b"\n")?;
        }
        Ok(())
    }
}
