use std::fs;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write as _};
use std::path::Path;

use anyhow::{bail, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::bits::{prefix_label, BitPattern, PrefixSet};
use crate::errors::TraceError;
use crate::radix::{EntryId, RadixTree};
use crate::region::{MemSource, Region, RegionType, REGION_TYPES};

/// Accumulated observations for one (opcode, region-type, prefix-set)
/// combination.
#[derive(Debug, Default, Clone, Copy)]
struct CounterSlot {
    prefixes: PrefixSet,
    n: u64,
    cycles_total: u64,
    cycles_min: u32,
    cycles_max: u32,
}

/// Per-region-type counter chain. The head slot is inline so the common
/// case, an instruction with no prefixes, never allocates.
#[derive(Debug, Default)]
struct CounterChain {
    head: CounterSlot,
    more: Vec<CounterSlot>,
}

impl CounterChain {
    fn slot_mut(&mut self, prefixes: PrefixSet) -> &mut CounterSlot {
        if self.head.prefixes == prefixes {
            return &mut self.head;
        }
        if let Some(pos) = self.more.iter().position(|s| s.prefixes == prefixes) {
            return &mut self.more[pos];
        }
        self.more.push(CounterSlot {
            prefixes,
            ..CounterSlot::default()
        });
        let last = self.more.len() - 1;
        &mut self.more[last]
    }

    fn slots(&self) -> impl Iterator<Item = &CounterSlot> {
        std::iter::once(&self.head).chain(self.more.iter())
    }
}

/// A terminal instruction pattern with its per-region-type counters.
pub struct Opcode {
    pattern: BitPattern,
    mnemonic: String,
    detail: Option<String>,
    counts: [CounterChain; RegionType::COUNT],
}

/// A pattern consumed ahead of the opcode proper. Matching a prefix adds
/// its id to the step's prefix set and advances the fetch position by the
/// number of instruction bytes the pattern covers.
pub struct Prefix {
    pattern: BitPattern,
    id: u8,
    nbytes: usize,
    detail: Option<String>,
}

pub enum Entry {
    Op(Opcode),
    Prefix(Prefix),
}

/// The opcode identification engine: a radix tree over instruction bit
/// patterns, the entries it identifies, and everything needed to turn the
/// accumulated counters into a report.
pub struct OpTree {
    tree: RadixTree,
    entries: Vec<Entry>,
    /// Prefix entries in declaration order; position is the prefix id.
    prefixes: Vec<EntryId>,
    catchall: Option<EntryId>,
    seen: [bool; RegionType::COUNT],
    print_zero: bool,
    last_unknown_pc: Option<u64>,
    out: Option<File>,
}

impl OpTree {
    pub fn new(print_zero: bool) -> Self {
        OpTree {
            tree: RadixTree::new(),
            entries: Vec::new(),
            prefixes: Vec::new(),
            catchall: None,
            seen: [false; RegionType::COUNT],
            print_zero,
            last_unknown_pc: None,
            out: None,
        }
    }

    /// Loads a bitpattern definition file. `<prefix>` and `<op>` elements
    /// are inserted into the tree; anything else is ignored. Duplicate
    /// patterns are dropped with a warning; malformed ones are fatal.
    pub fn load(&mut self, path: &str) -> Result<()> {
        let text = fs::read_to_string(path).map_err(|source| TraceError::NoInput {
            path: path.to_string(),
            source,
        })?;
        self.load_str(&text, path)
    }

    fn load_str(&mut self, text: &str, path: &str) -> Result<()> {
        let mut reader = Reader::from_str(text);
        reader.trim_text(true);

        let mut buf = Vec::new();
        loop {
            let event = match reader.read_event(&mut buf) {
                Ok(event) => event,
                Err(err) => {
                    return Err(TraceError::Parse {
                        path: path.to_string(),
                        line: line_of(text, reader.buffer_position()),
                        msg: err.to_string(),
                    }
                    .into())
                }
            };

            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let line = line_of(text, reader.buffer_position());
                    match e.name() {
                        b"prefix" => self.parse_prefix(e, path, line)?,
                        b"op" => self.parse_op(e, path, line)?,
                        _ => {}
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        Ok(())
    }

    fn parse_prefix(&mut self, elem: &BytesStart, path: &str, line: usize) -> Result<()> {
        if self.prefixes.len() >= PrefixSet::CAPACITY {
            return Err(TraceError::TooManyPrefixes(PrefixSet::CAPACITY).into());
        }

        let bitmask = require_attr(elem, b"bitmask", path, line)?;
        let detail = attr(elem, b"detail", path, line)?;

        let pattern = parse_pattern(&bitmask, path, line)?;
        if pattern.is_empty() {
            return Err(TraceError::Parse {
                path: path.to_string(),
                line,
                msg: format!("prefix bitmask \"{}\" has no significant bits", bitmask),
            }
            .into());
        }

        let id = self.prefixes.len() as u8;
        let nbytes = pattern.len_bytes();
        let entry_id = self.entries.len();
        self.entries.push(Entry::Prefix(Prefix {
            pattern: pattern.clone(),
            id,
            nbytes,
            detail,
        }));

        match self.tree.insert(&pattern, entry_id) {
            Ok(()) => {
                self.prefixes.push(entry_id);
            }
            Err(_) => {
                log::warn!("duplicate prefix bitmask \"{}\"; ignoring", bitmask);
                self.entries.pop();
            }
        }

        Ok(())
    }

    fn parse_op(&mut self, elem: &BytesStart, path: &str, line: usize) -> Result<()> {
        let bitmask = require_attr(elem, b"bitmask", path, line)?;
        let mnemonic = match attr(elem, b"mneumonic", path, line)? {
            Some(mnemonic) => mnemonic,
            None => {
                return Err(TraceError::Parse {
                    path: path.to_string(),
                    line,
                    msg: "mneumonic missing".to_string(),
                }
                .into())
            }
        };
        let detail = attr(elem, b"detail", path, line)?;

        let pattern = parse_pattern(&bitmask, path, line)?;
        let entry_id = self.entries.len();
        self.entries.push(Entry::Op(Opcode {
            pattern: pattern.clone(),
            mnemonic: mnemonic.clone(),
            detail,
            counts: Default::default(),
        }));

        match self.tree.insert(&pattern, entry_id) {
            Ok(()) => {
                if pattern.is_empty() {
                    self.catchall = Some(entry_id);
                }
            }
            Err(existing) => {
                match &self.entries[existing] {
                    Entry::Op(op) => log::warn!(
                        "opcodes {} and {} have the same bitmask \"{}\"",
                        mnemonic,
                        op.mnemonic,
                        bitmask
                    ),
                    Entry::Prefix(_) => log::warn!(
                        "opcode {} duplicates a prefix bitmask \"{}\"",
                        mnemonic,
                        bitmask
                    ),
                }
                self.entries.pop();
            }
        }

        Ok(())
    }

    /// Installs the default catch-all opcode if the definition files did
    /// not supply one, so every lookup resolves.
    pub fn ensure_catchall(&mut self) -> Result<()> {
        if self.catchall.is_some() {
            return Ok(());
        }

        let pattern = BitPattern::parse("")?;
        let entry_id = self.entries.len();
        self.entries.push(Entry::Op(Opcode {
            pattern: pattern.clone(),
            mnemonic: "unknown".to_string(),
            detail: None,
            counts: Default::default(),
        }));
        if self.tree.insert(&pattern, entry_id).is_err() {
            self.entries.pop();
            bail!("catch-all pattern already present but not recorded");
        }
        self.catchall = Some(entry_id);
        Ok(())
    }

    /// Identifies the instruction at `pc` and bumps its counter.
    ///
    /// This is the hot path: one cached region read and one tree lookup
    /// per instruction, plus one more of each per prefix byte.
    pub fn update(
        &mut self,
        mem: &dyn MemSource,
        region: &mut Region,
        pc: u64,
        cycles: u32,
    ) -> Result<()> {
        let rtype = region.rtype();
        self.seen[rtype.index()] = true;

        let mut p = pc;
        let mut prefixes = PrefixSet::EMPTY;
        let op_id = loop {
            let mut raw = [0u8; 4];
            let take = region.end().saturating_sub(p).min(4) as usize;
            if take > 0 {
                // Short reads leave the remaining key bytes zero.
                let _ = region.read(mem, p, &mut raw[..take])?;
            }
            let key = u32::from_be_bytes(raw);

            let id = match self.tree.lookup(key) {
                Some(id) => id,
                None => bail!("no pattern matched key 0x{:08x} at 0x{:08x}", key, p),
            };
            match &self.entries[id] {
                Entry::Prefix(prefix) => {
                    prefixes.add(prefix.id);
                    p += prefix.nbytes as u64;
                }
                Entry::Op(_) => break id,
            }
        };

        let op = match &mut self.entries[op_id] {
            Entry::Op(op) => op,
            Entry::Prefix(_) => unreachable!(),
        };

        let slot = op.counts[rtype.index()].slot_mut(prefixes);
        slot.n += 1;
        slot.cycles_total += u64::from(cycles);
        if slot.n == 1 {
            slot.cycles_min = cycles;
            slot.cycles_max = cycles;
        } else if cycles < slot.cycles_min {
            slot.cycles_min = cycles;
        } else if cycles > slot.cycles_max {
            slot.cycles_max = cycles;
        }

        if op.pattern.is_empty() && self.last_unknown_pc != Some(pc) {
            log::warn!("unknown opcode at pc 0x{:08x}", pc);
            self.last_unknown_pc = Some(pc);
        }

        Ok(())
    }

    /// Opens the report file. The handle stays open for the life of the
    /// trace; checkpoints rewrite it in place.
    pub fn output_open(&mut self, path: &Path) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| TraceError::CantCreate {
                path: path.display().to_string(),
                source,
            })?;
        self.out = Some(file);
        Ok(())
    }

    /// Writes the report to the open output file. The counters only grow,
    /// so rewriting from the start never leaves stale bytes behind.
    pub fn output(&mut self) -> Result<()> {
        let mut file = match self.out.take() {
            Some(file) => file,
            None => bail!("report stream not open"),
        };

        let result = (|| -> Result<()> {
            file.seek(SeekFrom::Start(0))?;
            self.write_report(&mut file)?;
            file.flush()?;
            Ok(())
        })();

        self.out = Some(file);
        result
    }

    fn write_report<W: std::io::Write>(&self, out: W) -> Result<()> {
        let mut writer = Writer::new_with_indent(out, b' ', 4);

        writer.write_event(Event::Decl(BytesDecl::new(b"1.0", Some(b"UTF-8"), None)))?;
        writer.write_event(Event::Start(BytesStart::borrowed_name(b"dyntrace")))?;

        for &id in &self.prefixes {
            if let Entry::Prefix(prefix) = &self.entries[id] {
                let mut elem = BytesStart::borrowed_name(b"prefix");
                elem.push_attribute(("id", prefix_label(prefix.id).as_str()));
                elem.push_attribute(("bitmask", prefix.pattern.text()));
                if let Some(detail) = &prefix.detail {
                    elem.push_attribute(("detail", detail.as_str()));
                }
                writer.write_event(Event::Empty(elem))?;
            }
        }

        let mut order = Vec::new();
        self.tree.walk(|id| order.push(id));

        for rtype in REGION_TYPES.iter().copied() {
            if !self.seen[rtype.index()] {
                continue;
            }

            let mut region_elem = BytesStart::borrowed_name(b"region");
            region_elem.push_attribute(("type", rtype.name()));
            writer.write_event(Event::Start(region_elem))?;

            for &id in &order {
                let op = match &self.entries[id] {
                    Entry::Op(op) => op,
                    Entry::Prefix(_) => continue,
                };

                let slots: Vec<&CounterSlot> = op.counts[rtype.index()]
                    .slots()
                    .filter(|s| s.n > 0 || self.print_zero)
                    .collect();
                if slots.is_empty() {
                    continue;
                }

                let mut op_elem = BytesStart::borrowed_name(b"op");
                op_elem.push_attribute(("bitmask", op.pattern.text()));
                op_elem.push_attribute(("mneumonic", op.mnemonic.as_str()));
                if let Some(detail) = &op.detail {
                    op_elem.push_attribute(("detail", detail.as_str()));
                }
                writer.write_event(Event::Start(op_elem))?;

                for slot in slots {
                    let mut count_elem = BytesStart::borrowed_name(b"count");
                    count_elem.push_attribute(("prefixes", slot.prefixes.render().as_str()));
                    count_elem.push_attribute(("n", slot.n.to_string().as_str()));
                    if slot.cycles_total > 0 {
                        count_elem
                            .push_attribute(("cycles", slot.cycles_total.to_string().as_str()));
                        count_elem.push_attribute(("min", slot.cycles_min.to_string().as_str()));
                        count_elem.push_attribute(("max", slot.cycles_max.to_string().as_str()));
                    }
                    writer.write_event(Event::Empty(count_elem))?;
                }

                writer.write_event(Event::End(BytesEnd::borrowed(b"op")))?;
            }

            writer.write_event(Event::End(BytesEnd::borrowed(b"region")))?;
        }

        writer.write_event(Event::End(BytesEnd::borrowed(b"dyntrace")))?;
        Ok(())
    }
}

fn line_of(text: &str, pos: usize) -> usize {
    let pos = pos.min(text.len());
    text.as_bytes()[..pos].iter().filter(|&&b| b == b'\n').count() + 1
}

fn parse_pattern(bitmask: &str, path: &str, line: usize) -> Result<BitPattern> {
    BitPattern::parse(bitmask).map_err(|err| {
        TraceError::Parse {
            path: path.to_string(),
            line,
            msg: err.to_string(),
        }
        .into()
    })
}

fn attr(elem: &BytesStart, name: &[u8], path: &str, line: usize) -> Result<Option<String>> {
    for attr in elem.attributes() {
        let attr = attr.map_err(|err| TraceError::Parse {
            path: path.to_string(),
            line,
            msg: err.to_string(),
        })?;
        if attr.key == name {
            let value = attr.unescaped_value().map_err(|err| TraceError::Parse {
                path: path.to_string(),
                line,
                msg: err.to_string(),
            })?;
            return Ok(Some(String::from_utf8_lossy(&value).into_owned()));
        }
    }
    Ok(None)
}

fn require_attr(elem: &BytesStart, name: &[u8], path: &str, line: usize) -> Result<String> {
    match attr(elem, name, path, line)? {
        Some(value) => Ok(value),
        None => Err(TraceError::Parse {
            path: path.to_string(),
            line,
            msg: format!("{} missing", String::from_utf8_lossy(name)),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TraceError;
    use crate::region::RegionList;
    use anyhow::Result;

    struct FakeMem {
        base: u64,
        bytes: Vec<u8>,
    }

    impl MemSource for FakeMem {
        fn read_mem(&self, addr: u64, dest: &mut [u8]) -> Result<usize> {
            let offset = (addr - self.base) as usize;
            let avail = self.bytes.len().saturating_sub(offset).min(dest.len());
            dest[..avail].copy_from_slice(&self.bytes[offset..offset + avail]);
            Ok(avail)
        }
    }

    fn setup(doc: &str, bytes: Vec<u8>) -> (OpTree, FakeMem, RegionList) {
        let mut optree = OpTree::new(false);
        optree.load_str(doc, "test.xml").unwrap();
        optree.ensure_catchall().unwrap();

        let len = bytes.len() as u64;
        let mem = FakeMem { base: 0x1000, bytes };
        let mut regions = RegionList::new();
        regions.update(0x1000, 0x1000 + len, RegionType::TextProgram, true);
        (optree, mem, regions)
    }

    fn report(optree: &OpTree) -> String {
        let mut out = Vec::new();
        optree.write_report(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_single_opcode_counted() {
        let doc = r#"<document><op bitmask="10101010" mneumonic="NOP"/></document>"#;
        let (mut optree, mem, mut regions) = setup(doc, vec![0xaa; 8]);
        let region = regions.lookup(0x1000).unwrap();

        for _ in 0..3 {
            optree.update(&mem, region, 0x1000, 0).unwrap();
        }

        let xml = report(&optree);
        assert!(xml.contains(r#"<op bitmask="10101010" mneumonic="NOP">"#));
        assert!(xml.contains(r#"<count prefixes="" n="3"/>"#));
        assert!(!xml.contains("cycles"));
        assert!(xml.contains(r#"<region type="text:program">"#));
    }

    #[test]
    fn test_prefix_then_opcode() {
        let doc = r#"<document>
            <prefix bitmask="11110000"/>
            <op bitmask="00001111" mneumonic="X"/>
        </document>"#;
        let (mut optree, mem, mut regions) = setup(doc, vec![0xf0, 0x0f, 0, 0, 0]);
        let region = regions.lookup(0x1000).unwrap();

        optree.update(&mem, region, 0x1000, 0).unwrap();

        let xml = report(&optree);
        assert!(xml.contains(r#"<prefix id="A" bitmask="11110000"/>"#));
        assert!(xml.contains(r#"<op bitmask="00001111" mneumonic="X">"#));
        assert!(xml.contains(r#"<count prefixes="A" n="1"/>"#));
    }

    #[test]
    fn test_duplicate_opcode_dropped() {
        let doc = r#"<document>
            <op bitmask="11111111" mneumonic="A"/>
            <op bitmask="11111111" mneumonic="B"/>
        </document>"#;
        let (mut optree, mem, mut regions) = setup(doc, vec![0xff; 8]);
        let region = regions.lookup(0x1000).unwrap();

        optree.update(&mem, region, 0x1000, 0).unwrap();

        let xml = report(&optree);
        assert!(xml.contains(r#"mneumonic="A""#));
        assert!(!xml.contains(r#"mneumonic="B""#));
    }

    #[test]
    fn test_cycles_min_max_total() {
        let doc = r#"<document><op bitmask="10101010" mneumonic="NOP"/></document>"#;
        let (mut optree, mem, mut regions) = setup(doc, vec![0xaa; 8]);
        let region = regions.lookup(0x1000).unwrap();

        optree.update(&mem, region, 0x1000, 5).unwrap();
        optree.update(&mem, region, 0x1000, 3).unwrap();
        optree.update(&mem, region, 0x1000, 4).unwrap();

        let xml = report(&optree);
        assert!(xml.contains(r#"cycles="12" min="3" max="5""#));
    }

    #[test]
    fn test_first_observation_initializes_min() {
        let doc = r#"<document><op bitmask="10101010" mneumonic="NOP"/></document>"#;
        let (mut optree, mem, mut regions) = setup(doc, vec![0xaa; 8]);
        let region = regions.lookup(0x1000).unwrap();

        // A first observation larger than zero must become the minimum.
        optree.update(&mem, region, 0x1000, 7).unwrap();
        optree.update(&mem, region, 0x1000, 9).unwrap();

        let xml = report(&optree);
        assert!(xml.contains(r#"cycles="16" min="7" max="9""#));
    }

    #[test]
    fn test_unknown_falls_through_to_catchall() {
        let doc = r#"<document><op bitmask="11111111" mneumonic="HLT"/></document>"#;
        let (mut optree, mem, mut regions) = setup(doc, vec![0x12, 0x34, 0x56, 0x78]);
        let region = regions.lookup(0x1000).unwrap();

        optree.update(&mem, region, 0x1000, 0).unwrap();
        assert_eq!(optree.last_unknown_pc, Some(0x1000));
        // A second hit at the same pc keeps the dedupe state unchanged.
        optree.update(&mem, region, 0x1000, 0).unwrap();
        assert_eq!(optree.last_unknown_pc, Some(0x1000));

        let xml = report(&optree);
        assert!(xml.contains(r#"<op bitmask="" mneumonic="unknown">"#));
        assert!(xml.contains(r#"<count prefixes="" n="2"/>"#));
    }

    #[test]
    fn test_too_many_prefixes_is_fatal() {
        let mut doc = String::from("<document>");
        for i in 0..33 {
            doc.push_str(&format!(r#"<prefix bitmask="{:08b}"/>"#, i));
        }
        doc.push_str("</document>");

        let mut optree = OpTree::new(false);
        let err = optree.load_str(&doc, "test.xml").unwrap_err();
        match err.downcast_ref::<TraceError>() {
            Some(TraceError::TooManyPrefixes(n)) => assert_eq!(*n, 32),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_missing_mneumonic_is_fatal() {
        let doc = r#"<document>
<op bitmask="11111111"/>
</document>"#;
        let mut optree = OpTree::new(false);
        let err = optree.load_str(doc, "ops.xml").unwrap_err();
        let msg = format!("{}", err);
        assert!(msg.contains("ops.xml"), "got: {}", msg);
        assert!(msg.contains("mneumonic missing"), "got: {}", msg);
    }

    #[test]
    fn test_bad_bitstring_is_fatal() {
        let doc = r#"<document><op bitmask="10102" mneumonic="Z"/></document>"#;
        let mut optree = OpTree::new(false);
        assert!(optree.load_str(doc, "ops.xml").is_err());
    }

    #[test]
    fn test_reports_are_idempotent() {
        let doc = r#"<document>
            <prefix bitmask="11110000"/>
            <op bitmask="00001111" mneumonic="X"/>
        </document>"#;
        let (mut optree, mem, mut regions) = setup(doc, vec![0xf0, 0x0f, 0, 0, 0]);
        let region = regions.lookup(0x1000).unwrap();
        optree.update(&mem, region, 0x1000, 2).unwrap();

        assert_eq!(report(&optree), report(&optree));
    }

    #[test]
    fn test_print_zero_emits_unhit_ops() {
        let doc = r#"<document>
            <op bitmask="10101010" mneumonic="NOP"/>
            <op bitmask="11111111" mneumonic="HLT"/>
        </document>"#;
        let mut optree = OpTree::new(true);
        optree.load_str(doc, "test.xml").unwrap();
        optree.ensure_catchall().unwrap();

        let mem = FakeMem {
            base: 0x1000,
            bytes: vec![0xaa; 8],
        };
        let mut regions = RegionList::new();
        regions.update(0x1000, 0x1008, RegionType::TextProgram, true);
        let region = regions.lookup(0x1000).unwrap();
        optree.update(&mem, region, 0x1000, 0).unwrap();

        let xml = report(&optree);
        assert!(xml.contains(r#"mneumonic="HLT""#));
        assert!(xml.contains(r#"n="0""#));
    }

    #[test]
    fn test_unseen_region_types_omitted() {
        let doc = r#"<document><op bitmask="10101010" mneumonic="NOP"/></document>"#;
        let (mut optree, mem, mut regions) = setup(doc, vec![0xaa; 8]);
        let region = regions.lookup(0x1000).unwrap();
        optree.update(&mem, region, 0x1000, 0).unwrap();

        let xml = report(&optree);
        assert!(xml.contains(r#"<region type="text:program">"#));
        assert!(!xml.contains(r#"<region type="stack">"#));
        assert!(!xml.contains(r#"<region type="unknown">"#));
    }
}
