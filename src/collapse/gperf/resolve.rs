use std::io;
use std::path::PathBuf;
use std::rc::Rc;

use ahash::AHashMap;

use super::maps::MappedRegion;
use super::symbols::{SectionLookup, SymbolSource, SymbolTable};

/// The frame name used for program counters that could not be resolved.
pub const UNKNOWN_SYMBOL: &str = "???";

#[derive(Debug)]
struct MappedObject {
    region: MappedRegion,
    symbols: Rc<SymbolTable>,
}

#[derive(Clone, Copy, Debug, Default)]
struct Naming {
    simplify_symbols: bool,
    annotate_libname: bool,
}

/// Maps raw program counters to symbol names.
///
/// Every distinct program counter is only resolved once; later requests for it are answered
/// from a cache.
#[derive(Debug, Default)]
pub struct Resolver {
    objects: Vec<MappedObject>,
    naming: Naming,
    cache: AHashMap<u64, Option<String>>,
}

impl Resolver {
    /// Creates a resolver from regions whose symbol tables have already been loaded.
    pub fn new<I>(objects: I) -> Self
    where
        I: IntoIterator<Item = (MappedRegion, SymbolTable)>,
    {
        Resolver {
            objects: objects
                .into_iter()
                .map(|(region, symbols)| MappedObject {
                    region,
                    symbols: Rc::new(symbols),
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Loads the symbol table of every region's backing file.
    ///
    /// Files mapped more than once are only inspected once.
    pub fn load<S, L>(regions: Vec<MappedRegion>, symbols: &S, sections: &L) -> io::Result<Self>
    where
        S: SymbolSource + ?Sized,
        L: SectionLookup + ?Sized,
    {
        let mut tables: AHashMap<PathBuf, Rc<SymbolTable>> = AHashMap::new();
        let mut objects = Vec::with_capacity(regions.len());
        for region in regions {
            let symbols = match tables.get(&region.path) {
                Some(table) => Rc::clone(table),
                None => {
                    let table = Rc::new(SymbolTable::load(&region.path, symbols, sections)?);
                    tables.insert(region.path.clone(), Rc::clone(&table));
                    table
                }
            };
            objects.push(MappedObject { region, symbols });
        }
        Ok(Resolver {
            objects,
            ..Default::default()
        })
    }

    /// Strip argument and template lists from symbol names.
    pub fn simplify_symbols(mut self, yes: bool) -> Self {
        self.naming.simplify_symbols = yes;
        self.cache.clear();
        self
    }

    /// Append ` [<library file name>]` to symbols that do not belong to the executable.
    pub fn annotate_libname(mut self, yes: bool) -> Self {
        self.naming.annotate_libname = yes;
        self.cache.clear();
        self
    }

    /// Resolves `pc`, returning `None` if it lies outside every mapping or before the first
    /// symbol of its mapping.
    pub fn resolve(&mut self, pc: u64) -> Option<&str> {
        let objects = &self.objects;
        let naming = self.naming;
        self.cache
            .entry(pc)
            .or_insert_with(|| lookup(objects, naming, pc))
            .as_deref()
    }

    /// Resolves every program counter in `pcs`.
    ///
    /// Program counters that cannot be resolved are left out of the returned map; callers
    /// substitute [`UNKNOWN_SYMBOL`] for them.
    pub fn resolve_batch<I>(&mut self, pcs: I) -> AHashMap<u64, String>
    where
        I: IntoIterator<Item = u64>,
    {
        let mut resolved = AHashMap::new();
        for pc in pcs {
            if resolved.contains_key(&pc) {
                continue;
            }
            if let Some(name) = self.resolve(pc) {
                let name = name.to_string();
                resolved.insert(pc, name);
            }
        }
        resolved
    }

    /// The number of distinct program counters resolved so far.
    pub fn resolved_count(&self) -> usize {
        self.cache.len()
    }
}

fn lookup(objects: &[MappedObject], naming: Naming, pc: u64) -> Option<String> {
    for object in objects {
        let region = &object.region;
        if !region.contains(pc) {
            continue;
        }

        // Move the runtime address into the address space of the object file.
        let target = pc
            .wrapping_sub(region.start)
            .wrapping_add(region.offset)
            .wrapping_add(object.symbols.pre_link_base());

        let symbol = match object.symbols.lookup(target) {
            Some(symbol) => symbol,
            None => {
                trace!(
                    "{:#x} precedes the first symbol of {}",
                    pc,
                    region.path.display()
                );
                continue;
            }
        };

        let mut name = if naming.simplify_symbols {
            symbol.simplified_name().to_string()
        } else {
            symbol.name.clone()
        };
        if naming.annotate_libname && !region.is_primary {
            name.push_str(" [");
            name.push_str(&region.file_name());
            name.push(']');
        }
        return Some(name);
    }
    None
}
