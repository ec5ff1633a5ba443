use std::io::{self, Read};

use byteorder::{NativeEndian, ReadBytesExt};

const HEADER_COUNT: u64 = 0;
const HEADER_SLOTS: u64 = 3;
const FORMAT_VERSION: u64 = 0;

// Guards against huge allocations for corrupt `num_pcs` fields; the vector still grows as
// needed while the program counters are read.
const MAX_PCS_PREALLOC: usize = 1024;

/// A single sampled call stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackSample {
    /// How many times this exact stack was sampled. Always at least one.
    pub weight: u64,
    /// Raw program counters, innermost frame first.
    pub pcs: Vec<u64>,
}

/// The decoded contents of a gperftools CPU profile.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Profile {
    /// Interval between two samples, in microseconds.
    pub sampling_period: u64,
    /// The sampled call stacks, in file order.
    pub samples: Vec<StackSample>,
    /// The process memory map that follows the binary trailer.
    pub memory_map: String,
}

// Map short reads to `InvalidData` so callers see every malformed profile the same way.
fn read_slot<R: Read>(reader: &mut R, what: &str) -> io::Result<u64> {
    match reader.read_u64::<NativeEndian>() {
        Ok(v) => Ok(v),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            invalid_data_error!("Profile is truncated: unexpected end of input in {}", what)
        }
        Err(e) => Err(e),
    }
}

fn read_header<R: Read>(reader: &mut R) -> io::Result<u64> {
    let count = read_slot(reader, "header")?;
    let slots = read_slot(reader, "header")?;
    let version = read_slot(reader, "header")?;
    let sampling_period = read_slot(reader, "header")?;
    let padding = read_slot(reader, "header")?;

    if count != HEADER_COUNT
        || slots != HEADER_SLOTS
        || version != FORMAT_VERSION
        || padding != 0
    {
        return invalid_data_error!(
            "Invalid profile header (count: {}, slots: {}, version: {}, padding: {}), \
             this is not a gperftools CPU profile",
            count,
            slots,
            version,
            padding
        );
    }
    if sampling_period == 0 {
        return invalid_data_error!("Invalid profile header: sampling period is zero");
    }
    Ok(sampling_period)
}

/// Decodes a gperftools CPU profile.
///
/// The binary part of the profile is a sequence of native-endian 64-bit words:
///
/// ```text
/// header:  0 3 0 <sampling period in us> 0
/// record:  <weight> <num pcs> <pc>...       (weight > 0)
/// trailer: 0 1 0
/// ```
///
/// Everything after the trailer is the text of the profiled process' memory map.
///
/// A malformed header or trailer, or input that ends before the trailer, is reported as an
/// [`io::ErrorKind::InvalidData`] error; nothing is returned for partially read profiles.
pub fn parse<R: Read>(mut reader: R) -> io::Result<Profile> {
    let sampling_period = read_header(&mut reader)?;
    debug!("Sampling period is {}us", sampling_period);

    let mut samples = Vec::new();
    loop {
        let weight = read_slot(&mut reader, "record header")?;
        let npcs = read_slot(&mut reader, "record header")?;

        if weight == 0 {
            if npcs != 1 {
                return invalid_data_error!(
                    "Invalid profile trailer: expected 1 program counter, found {}",
                    npcs
                );
            }
            read_slot(&mut reader, "trailer")?;
            break;
        }

        let capacity = usize::try_from(npcs).map_or(MAX_PCS_PREALLOC, |n| n.min(MAX_PCS_PREALLOC));
        let mut pcs = Vec::with_capacity(capacity);
        for _ in 0..npcs {
            pcs.push(read_slot(&mut reader, "stack record")?);
        }
        samples.push(StackSample { weight, pcs });
    }
    debug!("Read {} stack samples", samples.len());

    let mut rest = Vec::new();
    reader.read_to_end(&mut rest)?;
    let memory_map = match String::from_utf8(rest) {
        Ok(text) => text,
        Err(e) => {
            warn!("Memory map is not valid UTF-8, replacing invalid sequences");
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        }
    };

    Ok(Profile {
        sampling_period,
        samples,
        memory_map,
    })
}
