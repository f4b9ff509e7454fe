//! External merge sorter for ORDER BY.
//!
//! Input partitions into fixed-size sort containers; each container is
//! sorted in memory and spilled to the temp stream as one run, then the
//! runs k-way merge. Small inputs never touch the temp file.

use crate::bson::{codec, Array, Document, Value};
use crate::config::Collation;
use crate::error::{DbError, Result};
use crate::index::Order;
use crate::storage::stream::{PageStream, StreamFactory, StreamKind};

/// Size of one in-memory sort container.
pub const CONTAINER_SIZE: usize = 1024 * 1024;

/// Compare composite sort keys segment by segment, honoring per-segment
/// direction.
pub fn compare_keys(
    a: &[Value],
    b: &[Value],
    directions: &[Order],
    collation: &Collation,
) -> std::cmp::Ordering {
    for (i, direction) in directions.iter().enumerate() {
        let (x, y) = (
            a.get(i).unwrap_or(&Value::Null),
            b.get(i).unwrap_or(&Value::Null),
        );
        let ord = x.total_cmp(y, collation);
        let ord = match direction {
            Order::Ascending => ord,
            Order::Descending => ord.reverse(),
        };
        if ord != std::cmp::Ordering::Equal {
            return ord;
        }
    }
    std::cmp::Ordering::Equal
}

pub struct ExternalSorter<'a> {
    factory: &'a StreamFactory,
    collation: Collation,
    directions: Vec<Order>,
    buffer: Vec<(Vec<Value>, Document)>,
    buffer_bytes: usize,
    temp: Option<Box<dyn PageStream>>,
    /// (start, end) byte ranges of spilled runs.
    runs: Vec<(u64, u64)>,
}

impl<'a> ExternalSorter<'a> {
    pub fn new(factory: &'a StreamFactory, collation: Collation, directions: Vec<Order>) -> Self {
        ExternalSorter {
            factory,
            collation,
            directions,
            buffer: Vec::new(),
            buffer_bytes: 0,
            temp: None,
            runs: Vec::new(),
        }
    }

    pub fn push(&mut self, key: Vec<Value>, doc: Document) -> Result<()> {
        self.buffer_bytes += codec::document_len(&doc) + 64;
        self.buffer.push((key, doc));
        if self.buffer_bytes >= CONTAINER_SIZE {
            self.spill_container()?;
        }
        Ok(())
    }

    fn sort_buffer(&mut self) {
        let collation = self.collation.clone();
        let directions = self.directions.clone();
        self.buffer
            .sort_by(|(a, _), (b, _)| compare_keys(a, b, &directions, &collation));
    }

    fn spill_container(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.sort_buffer();
        if self.temp.is_none() {
            self.temp = Some(self.factory.open(StreamKind::Temp)?);
        }
        let stream = self.temp.as_mut().expect("opened above");

        let mut bytes = Vec::with_capacity(self.buffer_bytes);
        for (key, doc) in self.buffer.drain(..) {
            let key_value = Value::Array(Array::from(key));
            let mut key_bytes = Vec::new();
            codec::write_value(&mut key_bytes, &key_value);
            let doc_bytes = codec::serialize_document(&doc);
            bytes.extend_from_slice(&(key_bytes.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&key_bytes);
            bytes.extend_from_slice(&(doc_bytes.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&doc_bytes);
        }

        // containers are page-aligned ranges reserved from the shared temp
        // stream, so concurrent sorters never overlap
        let start = self.factory.reserve_temp(bytes.len() as u64);
        stream.write_page(start, &bytes)?;
        self.runs.push((start, start + bytes.len() as u64));
        self.buffer_bytes = 0;
        Ok(())
    }

    pub fn finish(mut self) -> Result<Vec<Document>> {
        if self.runs.is_empty() {
            self.sort_buffer();
            return Ok(self.buffer.into_iter().map(|(_, doc)| doc).collect());
        }
        self.spill_container()?;

        let stream = self.temp.as_mut().expect("runs imply a temp stream");
        let mut readers: Vec<RunReader> = self
            .runs
            .iter()
            .map(|&(start, end)| RunReader {
                position: start,
                end,
                head: None,
            })
            .collect();
        for reader in &mut readers {
            reader.advance(stream.as_mut())?;
        }

        let mut out = Vec::new();
        loop {
            let mut best: Option<usize> = None;
            for (i, reader) in readers.iter().enumerate() {
                let Some((key, _)) = &reader.head else { continue };
                let better = match best {
                    None => true,
                    Some(j) => {
                        let other = &readers[j].head.as_ref().expect("best has a head").0;
                        compare_keys(key, other, &self.directions, &self.collation)
                            == std::cmp::Ordering::Less
                    }
                };
                if better {
                    best = Some(i);
                }
            }
            let Some(winner) = best else { break };
            let (_, doc) = readers[winner].head.take().expect("winner has a head");
            out.push(doc);
            readers[winner].advance(stream.as_mut())?;
        }
        Ok(out)
    }
}

struct RunReader {
    position: u64,
    end: u64,
    head: Option<(Vec<Value>, Document)>,
}

impl RunReader {
    fn advance(&mut self, stream: &mut dyn PageStream) -> Result<()> {
        if self.position >= self.end {
            self.head = None;
            return Ok(());
        }
        let key_bytes = read_chunk(stream, &mut self.position)?;
        let (key_value, _) = codec::deserialize_value(&key_bytes)?;
        let doc_bytes = read_chunk(stream, &mut self.position)?;
        let doc = codec::deserialize_document(&doc_bytes)?;
        let key = match key_value {
            Value::Array(arr) => arr.into_vec(),
            other => vec![other],
        };
        self.head = Some((key, doc));
        Ok(())
    }
}

fn read_chunk(stream: &mut dyn PageStream, position: &mut u64) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_page(*position, &mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 || len > 64 * 1024 * 1024 {
        return Err(DbError::corruption("invalid sort spill entry"));
    }
    let mut bytes = vec![0u8; len];
    stream.read_page(*position + 4, &mut bytes)?;
    *position += 4 + len as u64;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::doc;

    fn factory() -> StreamFactory {
        StreamFactory::new(EngineSettings::default())
    }

    #[test]
    fn in_memory_sort() {
        let f = factory();
        let mut sorter =
            ExternalSorter::new(&f, Collation::ordinal(), vec![Order::Ascending]);
        for n in [5, 1, 4, 2, 3] {
            sorter
                .push(vec![Value::Int32(n)], doc! { "n" => n })
                .unwrap();
        }
        let sorted = sorter.finish().unwrap();
        let ns: Vec<i32> = sorted
            .iter()
            .map(|d| d.get("n").unwrap().as_i32().unwrap())
            .collect();
        assert_eq!(ns, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn two_segment_keys_with_mixed_directions() {
        let f = factory();
        let mut sorter = ExternalSorter::new(
            &f,
            Collation::ordinal(),
            vec![Order::Ascending, Order::Descending],
        );
        for (a, b) in [(1, 1), (0, 9), (1, 7), (0, 2)] {
            sorter
                .push(
                    vec![Value::Int32(a), Value::Int32(b)],
                    doc! { "a" => a, "b" => b },
                )
                .unwrap();
        }
        let sorted = sorter.finish().unwrap();
        let pairs: Vec<(i32, i32)> = sorted
            .iter()
            .map(|d| {
                (
                    d.get("a").unwrap().as_i32().unwrap(),
                    d.get("b").unwrap().as_i32().unwrap(),
                )
            })
            .collect();
        assert_eq!(pairs, vec![(0, 9), (0, 2), (1, 7), (1, 1)]);
    }

    #[test]
    fn spills_and_merges_runs() {
        let f = factory();
        let mut sorter =
            ExternalSorter::new(&f, Collation::ordinal(), vec![Order::Ascending]);
        let filler = "x".repeat(2048);
        let count = 2000u32; // ~4 MB of input forces several containers
        let mut order: Vec<u32> = (0..count).collect();
        order.sort_by_key(|k| (k * 48271) % count);
        for n in order {
            sorter
                .push(
                    vec![Value::Int64(n as i64)],
                    doc! { "n" => n as i64, "pad" => filler.clone() },
                )
                .unwrap();
        }
        let sorted = sorter.finish().unwrap();
        assert_eq!(sorted.len(), count as usize);
        assert!(sorted
            .windows(2)
            .all(|w| w[0].get("n").unwrap() <= w[1].get("n").unwrap()));
    }
}
