//! The KDBX XML document: `<KeePassFile><Meta>…</Meta><Root>…</Root>`.
//!
//! Protected values are XOR'd with the stateful inner stream in document
//! order, so the same `InnerStream` instance must be threaded through a
//! whole parse or serialize pass and never reused across passes.

use std::collections::{BTreeMap, HashMap};

use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::events::{BytesDecl, BytesText, Event};
use quick_xml::{Reader, Writer};
use uuid::Uuid;

use crate::codec;
use crate::crypto::inner_stream::InnerStream;
use crate::db::{
    Binary, CustomField, Database, Entry, FormatVersion, Group, MemoryProtection, Meta,
    SecureString,
};
use crate::error::{Error, Result};

pub(super) struct XmlContext<'a> {
    pub version: FormatVersion,
    pub stream: &'a mut InnerStream,
}

/// Everything extracted from one XML document.
pub(super) struct ParsedXml {
    pub meta: Meta,
    pub header_hash: Option<String>,
    pub groups: HashMap<Uuid, Group>,
    pub entries: HashMap<Uuid, Entry>,
    pub root: Option<Uuid>,
    /// KDBX 3.1 binary pool from `Meta/Binaries`, keyed by ID attribute.
    pub meta_binaries: BTreeMap<usize, Binary>,
}

type XmlReader<'a> = Reader<&'a [u8]>;

fn xml_err(e: quick_xml::Error) -> Error {
    Error::malformed(format!("xml: {e}"))
}

fn b64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn b64_decode(text: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(text.trim())
        .map_err(|_| Error::malformed("invalid base64 value"))
}

fn bool_text(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

fn parse_bool(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case("true")
}

fn parse_opt_bool(text: &str) -> Option<bool> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
        None
    } else {
        Some(parse_bool(trimmed))
    }
}

fn uuid_b64(uuid: &Uuid) -> String {
    b64(uuid.as_bytes())
}

fn parse_uuid_b64(text: &str) -> Result<Option<Uuid>> {
    if text.trim().is_empty() {
        return Ok(None);
    }
    let bytes = b64_decode(text)?;
    let uuid = codec::uuid_from_bytes(&bytes)?;
    Ok(Some(uuid))
}

fn format_time(time: &DateTime<Utc>, version: FormatVersion) -> String {
    if version.is_kdbx4() {
        b64(&codec::datetime_to_epoch_seconds(time).to_le_bytes())
    } else {
        time.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

fn parse_time(text: &str, version: FormatVersion) -> DateTime<Utc> {
    let trimmed = text.trim();
    if version.is_kdbx4() {
        if let Ok(bytes) = b64_decode(trimmed) {
            if bytes.len() == 8 {
                let seconds = i64::from_le_bytes(bytes.try_into().unwrap());
                return codec::datetime_from_epoch_seconds(seconds);
            }
        }
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| crate::db::times::safe_epoch())
}

// ---------------------------------------------------------------------
// Reading

/// Skip the rest of the subtree whose Start event was just consumed.
fn skip_subtree(reader: &mut XmlReader) -> Result<()> {
    let mut depth = 1u32;
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    return Ok(());
                }
            }
            Event::Eof => return Err(Error::malformed("unexpected end of xml")),
            _ => {}
        }
    }
}

/// Collect text until the named element closes.
fn read_text_content(reader: &mut XmlReader, end_name: &[u8]) -> Result<String> {
    let mut text = String::new();
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Text(t) => text.push_str(&t.unescape().map_err(xml_err)?),
            Event::CData(c) => text.push_str(&String::from_utf8_lossy(&c.into_inner())),
            Event::End(e) if e.name().as_ref() == end_name => break,
            Event::Start(_) => skip_subtree(reader)?,
            Event::Eof => return Err(Error::malformed("unexpected end of xml")),
            _ => {}
        }
    }
    Ok(text)
}

pub(super) fn parse(xml: &str, ctx: &mut XmlContext) -> Result<ParsedXml> {
    let mut reader = Reader::from_str(xml);
    let mut out = ParsedXml {
        meta: Meta::default(),
        header_hash: None,
        groups: HashMap::new(),
        entries: HashMap::new(),
        root: None,
        meta_binaries: BTreeMap::new(),
    };
    let mut saw_document = false;

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => match e.name().as_ref() {
                b"KeePassFile" => saw_document = true,
                b"Meta" => read_meta(&mut reader, ctx, &mut out)?,
                b"Root" => read_root(&mut reader, ctx, &mut out)?,
                _ => skip_subtree(&mut reader)?,
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_document {
        return Err(Error::malformed("not a KeePassFile document"));
    }
    Ok(out)
}

fn read_meta(reader: &mut XmlReader, ctx: &mut XmlContext, out: &mut ParsedXml) -> Result<()> {
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"Generator" => out.meta.generator = read_text_content(reader, &name)?,
                    b"HeaderHash" => {
                        out.header_hash = Some(read_text_content(reader, &name)?.trim().to_owned())
                    }
                    b"DatabaseName" => out.meta.name = read_text_content(reader, &name)?,
                    b"DatabaseDescription" => {
                        out.meta.description = read_text_content(reader, &name)?
                    }
                    b"MemoryProtection" => {
                        out.meta.memory_protection = read_memory_protection(reader)?
                    }
                    b"RecycleBinEnabled" => {
                        out.meta.recycle_bin_enabled =
                            parse_bool(&read_text_content(reader, &name)?)
                    }
                    b"RecycleBinUUID" => {
                        let uuid = parse_uuid_b64(&read_text_content(reader, &name)?)?;
                        out.meta.recycle_bin_uuid = uuid.filter(|u| !u.is_nil());
                    }
                    b"HistoryMaxItems" => {
                        out.meta.history_max_items = read_text_content(reader, &name)?
                            .trim()
                            .parse()
                            .unwrap_or(crate::db::DEFAULT_HISTORY_MAX_ITEMS)
                    }
                    b"HistoryMaxSize" => {
                        out.meta.history_max_size = read_text_content(reader, &name)?
                            .trim()
                            .parse()
                            .unwrap_or(crate::db::DEFAULT_HISTORY_MAX_SIZE)
                    }
                    b"CustomIcons" => read_custom_icons(reader, out)?,
                    b"CustomData" => read_custom_data(reader, &mut out.meta.custom_data)?,
                    b"Binaries" => read_meta_binaries(reader, ctx, out)?,
                    _ => skip_subtree(reader)?,
                }
            }
            Event::End(e) if e.name().as_ref() == b"Meta" => return Ok(()),
            Event::Eof => return Err(Error::malformed("unexpected end of xml")),
            _ => {}
        }
    }
}

fn read_memory_protection(reader: &mut XmlReader) -> Result<MemoryProtection> {
    let mut protection = MemoryProtection::default();
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                let value = parse_bool(&read_text_content(reader, &name)?);
                match name.as_slice() {
                    b"ProtectTitle" => protection.protect_title = value,
                    b"ProtectUserName" => protection.protect_username = value,
                    b"ProtectPassword" => protection.protect_password = value,
                    b"ProtectURL" => protection.protect_url = value,
                    b"ProtectNotes" => protection.protect_notes = value,
                    _ => {}
                }
            }
            Event::End(e) if e.name().as_ref() == b"MemoryProtection" => return Ok(protection),
            Event::Eof => return Err(Error::malformed("unexpected end of xml")),
            _ => {}
        }
    }
}

fn read_custom_icons(reader: &mut XmlReader, out: &mut ParsedXml) -> Result<()> {
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) if e.name().as_ref() == b"Icon" => {
                let mut uuid = None;
                let mut data = Vec::new();
                loop {
                    match reader.read_event().map_err(xml_err)? {
                        Event::Start(e) => {
                            let name = e.name().as_ref().to_vec();
                            match name.as_slice() {
                                b"UUID" => {
                                    uuid = parse_uuid_b64(&read_text_content(reader, &name)?)?
                                }
                                b"Data" => data = b64_decode(&read_text_content(reader, &name)?)?,
                                _ => skip_subtree(reader)?,
                            }
                        }
                        Event::End(e) if e.name().as_ref() == b"Icon" => break,
                        Event::Eof => return Err(Error::malformed("unexpected end of xml")),
                        _ => {}
                    }
                }
                if let Some(uuid) = uuid {
                    out.meta.custom_icons.insert(uuid, data);
                }
            }
            Event::Start(_) => skip_subtree(reader)?,
            Event::End(e) if e.name().as_ref() == b"CustomIcons" => return Ok(()),
            Event::Eof => return Err(Error::malformed("unexpected end of xml")),
            _ => {}
        }
    }
}

fn read_custom_data(reader: &mut XmlReader, target: &mut BTreeMap<String, String>) -> Result<()> {
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) if e.name().as_ref() == b"Item" => {
                let mut key = String::new();
                let mut value = String::new();
                loop {
                    match reader.read_event().map_err(xml_err)? {
                        Event::Start(e) => {
                            let name = e.name().as_ref().to_vec();
                            match name.as_slice() {
                                b"Key" => key = read_text_content(reader, &name)?,
                                b"Value" => value = read_text_content(reader, &name)?,
                                _ => skip_subtree(reader)?,
                            }
                        }
                        Event::End(e) if e.name().as_ref() == b"Item" => break,
                        Event::Eof => return Err(Error::malformed("unexpected end of xml")),
                        _ => {}
                    }
                }
                target.insert(key, value);
            }
            Event::Start(_) => skip_subtree(reader)?,
            Event::End(e) if e.name().as_ref() == b"CustomData" => return Ok(()),
            Event::Eof => return Err(Error::malformed("unexpected end of xml")),
            _ => {}
        }
    }
}

fn read_meta_binaries(
    reader: &mut XmlReader,
    ctx: &mut XmlContext,
    out: &mut ParsedXml,
) -> Result<()> {
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) if e.name().as_ref() == b"Binary" => {
                let mut id = None;
                let mut compressed = false;
                let mut protected = false;
                for attr in e.attributes().flatten() {
                    let value = String::from_utf8_lossy(&attr.value).into_owned();
                    match attr.key.as_ref() {
                        b"ID" => id = value.trim().parse::<usize>().ok(),
                        b"Compressed" => compressed = parse_bool(&value),
                        b"Protected" => protected = parse_bool(&value),
                        _ => {}
                    }
                }
                let mut data = b64_decode(&read_text_content(reader, b"Binary")?)?;
                if protected {
                    ctx.stream.apply(&mut data);
                }
                if compressed {
                    data = super::gunzip(&data)?;
                }
                let id = id.ok_or_else(|| Error::malformed("binary without an ID"))?;
                out.meta_binaries.insert(
                    id,
                    Binary {
                        data,
                        protected: false,
                    },
                );
            }
            Event::Start(_) => skip_subtree(reader)?,
            Event::End(e) if e.name().as_ref() == b"Binaries" => return Ok(()),
            Event::Eof => return Err(Error::malformed("unexpected end of xml")),
            _ => {}
        }
    }
}

fn read_root(reader: &mut XmlReader, ctx: &mut XmlContext, out: &mut ParsedXml) -> Result<()> {
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) if e.name().as_ref() == b"Group" => {
                let uuid = read_group(reader, ctx, None, out)?;
                if out.root.is_none() {
                    out.root = Some(uuid);
                }
            }
            Event::Start(_) => skip_subtree(reader)?, // DeletedObjects etc.
            Event::End(e) if e.name().as_ref() == b"Root" => return Ok(()),
            Event::Eof => return Err(Error::malformed("unexpected end of xml")),
            _ => {}
        }
    }
}

fn read_group(
    reader: &mut XmlReader,
    ctx: &mut XmlContext,
    parent: Option<Uuid>,
    out: &mut ParsedXml,
) -> Result<Uuid> {
    let mut group = Group::new("");
    group.parent = parent;

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"UUID" => {
                        if let Some(uuid) = parse_uuid_b64(&read_text_content(reader, &name)?)? {
                            group.uuid = uuid;
                        }
                    }
                    b"Name" => group.name = read_text_content(reader, &name)?,
                    b"Notes" => group.notes = read_text_content(reader, &name)?,
                    b"IconID" => {
                        group.icon_id = read_text_content(reader, &name)?
                            .trim()
                            .parse()
                            .unwrap_or(48)
                    }
                    b"CustomIconUUID" => {
                        group.custom_icon = parse_uuid_b64(&read_text_content(reader, &name)?)?
                            .filter(|u| !u.is_nil())
                    }
                    b"Times" => group.times = read_times(reader, ctx.version)?,
                    b"IsExpanded" => {
                        group.is_expanded = parse_bool(&read_text_content(reader, &name)?)
                    }
                    b"DefaultAutoTypeSequence" => {
                        group.default_auto_type_sequence = read_text_content(reader, &name)?
                    }
                    b"EnableAutoType" => {
                        group.enable_auto_type =
                            parse_opt_bool(&read_text_content(reader, &name)?)
                    }
                    b"EnableSearching" => {
                        group.enable_searching =
                            parse_opt_bool(&read_text_content(reader, &name)?)
                    }
                    b"LastTopVisibleEntry" => {
                        group.last_top_visible_entry =
                            parse_uuid_b64(&read_text_content(reader, &name)?)?
                                .filter(|u| !u.is_nil())
                    }
                    b"Entry" => {
                        let entry = read_entry(reader, ctx, Some(group.uuid), out)?;
                        group.entries.push(entry.uuid);
                        out.entries.insert(entry.uuid, entry);
                    }
                    b"Group" => {
                        // Children may precede the UUID element only in
                        // hand-crafted files; KeePass always writes the
                        // UUID first, which this relies on.
                        let child = read_group(reader, ctx, Some(group.uuid), out)?;
                        group.groups.push(child);
                    }
                    _ => skip_subtree(reader)?,
                }
            }
            Event::End(e) if e.name().as_ref() == b"Group" => break,
            Event::Eof => return Err(Error::malformed("unexpected end of xml")),
            _ => {}
        }
    }

    let uuid = group.uuid;
    out.groups.insert(uuid, group);
    Ok(uuid)
}

fn read_entry(
    reader: &mut XmlReader,
    ctx: &mut XmlContext,
    parent: Option<Uuid>,
    out: &mut ParsedXml,
) -> Result<Entry> {
    let mut entry = Entry::new("");
    entry.parent = parent;

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"UUID" => {
                        if let Some(uuid) = parse_uuid_b64(&read_text_content(reader, &name)?)? {
                            entry.uuid = uuid;
                        }
                    }
                    b"IconID" => {
                        entry.icon_id = read_text_content(reader, &name)?
                            .trim()
                            .parse()
                            .unwrap_or(0)
                    }
                    b"CustomIconUUID" => {
                        entry.custom_icon = parse_uuid_b64(&read_text_content(reader, &name)?)?
                            .filter(|u| !u.is_nil())
                    }
                    b"ForegroundColor" => {
                        entry.foreground_color = read_text_content(reader, &name)?
                    }
                    b"BackgroundColor" => {
                        entry.background_color = read_text_content(reader, &name)?
                    }
                    b"OverrideURL" => entry.override_url = read_text_content(reader, &name)?,
                    b"Tags" => {
                        entry.tags = read_text_content(reader, &name)?
                            .split([';', ','])
                            .map(str::trim)
                            .filter(|t| !t.is_empty())
                            .map(str::to_owned)
                            .collect()
                    }
                    b"Times" => entry.times = read_times(reader, ctx.version)?,
                    b"String" => read_entry_string(reader, ctx, &mut entry)?,
                    b"Binary" => read_entry_binary(reader, &mut entry)?,
                    b"AutoType" => read_auto_type(reader, &mut entry)?,
                    b"History" => read_history(reader, ctx, &mut entry, out)?,
                    _ => skip_subtree(reader)?,
                }
            }
            Event::End(e) if e.name().as_ref() == b"Entry" => break,
            Event::Eof => return Err(Error::malformed("unexpected end of xml")),
            _ => {}
        }
    }
    Ok(entry)
}

fn read_times(reader: &mut XmlReader, version: FormatVersion) -> Result<crate::db::Times> {
    let mut times = crate::db::Times::now();
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                let text = read_text_content(reader, &name)?;
                match name.as_slice() {
                    b"CreationTime" => times.creation = parse_time(&text, version),
                    b"LastModificationTime" => {
                        times.last_modification = parse_time(&text, version)
                    }
                    b"LastAccessTime" => times.last_access = parse_time(&text, version),
                    b"ExpiryTime" => times.expiry = parse_time(&text, version),
                    b"Expires" => times.expires = parse_bool(&text),
                    b"UsageCount" => times.usage_count = text.trim().parse().unwrap_or(0),
                    b"LocationChanged" => times.location_changed = parse_time(&text, version),
                    _ => {}
                }
            }
            Event::End(e) if e.name().as_ref() == b"Times" => return Ok(times),
            Event::Eof => return Err(Error::malformed("unexpected end of xml")),
            _ => {}
        }
    }
}

fn read_entry_string(
    reader: &mut XmlReader,
    ctx: &mut XmlContext,
    entry: &mut Entry,
) -> Result<()> {
    let mut key = String::new();
    let mut value = String::new();
    let mut protected = false;

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"Key" => key = read_text_content(reader, &name)?,
                    b"Value" => {
                        protected = e.attributes().flatten().any(|a| {
                            a.key.as_ref() == b"Protected"
                                && parse_bool(&String::from_utf8_lossy(&a.value))
                        });
                        let raw = read_text_content(reader, &name)?;
                        value = if protected {
                            let mut bytes = b64_decode(&raw)?;
                            ctx.stream.apply(&mut bytes);
                            String::from_utf8_lossy(&bytes).into_owned()
                        } else {
                            raw
                        };
                    }
                    _ => skip_subtree(reader)?,
                }
            }
            Event::Empty(e) if e.name().as_ref() == b"Value" => {
                protected = e.attributes().flatten().any(|a| {
                    a.key.as_ref() == b"Protected"
                        && parse_bool(&String::from_utf8_lossy(&a.value))
                });
                value.clear();
            }
            Event::End(e) if e.name().as_ref() == b"String" => break,
            Event::Eof => return Err(Error::malformed("unexpected end of xml")),
            _ => {}
        }
    }

    match key.as_str() {
        "Title" => entry.title = value,
        "UserName" => entry.username = value,
        "Password" => entry.password = SecureString::new(value),
        "URL" => entry.url = value,
        "Notes" => entry.notes = value,
        _ => {
            entry
                .custom_fields
                .insert(key, CustomField { value, protected });
        }
    }
    Ok(())
}

fn read_entry_binary(reader: &mut XmlReader, entry: &mut Entry) -> Result<()> {
    let mut key = String::new();
    let mut reference = None;
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"Key" => key = read_text_content(reader, &name)?,
                    b"Value" => {
                        reference = value_ref(&e);
                        read_text_content(reader, &name)?;
                    }
                    _ => skip_subtree(reader)?,
                }
            }
            Event::Empty(e) if e.name().as_ref() == b"Value" => reference = value_ref(&e),
            Event::End(e) if e.name().as_ref() == b"Binary" => break,
            Event::Eof => return Err(Error::malformed("unexpected end of xml")),
            _ => {}
        }
    }
    if let Some(index) = reference {
        entry.binaries.insert(key, index);
    }
    Ok(())
}

fn value_ref(e: &quick_xml::events::BytesStart) -> Option<usize> {
    e.attributes().flatten().find_map(|a| {
        if a.key.as_ref() == b"Ref" {
            String::from_utf8_lossy(&a.value).trim().parse().ok()
        } else {
            None
        }
    })
}

fn read_auto_type(reader: &mut XmlReader, entry: &mut Entry) -> Result<()> {
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"Enabled" => {
                        entry.auto_type_enabled = parse_bool(&read_text_content(reader, &name)?)
                    }
                    _ => skip_subtree(reader)?,
                }
            }
            Event::End(e) if e.name().as_ref() == b"AutoType" => return Ok(()),
            Event::Eof => return Err(Error::malformed("unexpected end of xml")),
            _ => {}
        }
    }
}

fn read_history(
    reader: &mut XmlReader,
    ctx: &mut XmlContext,
    entry: &mut Entry,
    out: &mut ParsedXml,
) -> Result<()> {
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) if e.name().as_ref() == b"Entry" => {
                let snapshot = read_entry(reader, ctx, entry.parent, out)?;
                entry.history.push(snapshot);
            }
            Event::Start(_) => skip_subtree(reader)?,
            Event::End(e) if e.name().as_ref() == b"History" => return Ok(()),
            Event::Eof => return Err(Error::malformed("unexpected end of xml")),
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------
// Writing

type XmlWriter<'a> = Writer<&'a mut Vec<u8>>;

fn text_el(writer: &mut XmlWriter, name: &str, value: &str) -> Result<()> {
    writer
        .create_element(name)
        .write_text_content(BytesText::new(value))
        .map_err(xml_err)?;
    Ok(())
}

fn bool_el(writer: &mut XmlWriter, name: &str, value: bool) -> Result<()> {
    text_el(writer, name, bool_text(value))
}

fn opt_bool_el(writer: &mut XmlWriter, name: &str, value: Option<bool>) -> Result<()> {
    text_el(writer, name, value.map_or("null", bool_text))
}

pub(super) fn serialize(
    database: &Database,
    ctx: &mut XmlContext,
    header_hash: Option<&str>,
) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut writer = Writer::new(&mut buf);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
        .map_err(xml_err)?;

    writer
        .create_element("KeePassFile")
        .write_inner_content(|w| {
            write_meta(w, database, ctx, header_hash).map_err(io_shim)?;
            w.create_element("Root")
                .write_inner_content(|w| {
                    write_group(w, database, ctx, database.root_uuid()).map_err(io_shim)?;
                    w.create_element("DeletedObjects")
                        .write_empty()
                        .map(|_| ())
                })
                .map(|_| ())
        })
        .map_err(xml_err)?;

    Ok(buf)
}

// `write_inner_content` closures surface errors as quick_xml::Error; fold
// our own errors through io::Error to keep the chain intact.
fn io_shim(e: Error) -> quick_xml::Error {
    quick_xml::Error::Io(std::sync::Arc::new(std::io::Error::new(
        std::io::ErrorKind::Other,
        e.to_string(),
    )))
}

fn write_meta(
    writer: &mut XmlWriter,
    database: &Database,
    ctx: &mut XmlContext,
    header_hash: Option<&str>,
) -> Result<()> {
    let meta = &database.meta;
    let version = ctx.version;
    writer
        .create_element("Meta")
        .write_inner_content(|w| {
            text_el(w, "Generator", &meta.generator).map_err(io_shim)?;
            if let Some(hash) = header_hash {
                text_el(w, "HeaderHash", hash).map_err(io_shim)?;
            }
            text_el(w, "DatabaseName", &meta.name).map_err(io_shim)?;
            text_el(w, "DatabaseDescription", &meta.description).map_err(io_shim)?;
            let protection = &meta.memory_protection;
            w.create_element("MemoryProtection")
                .write_inner_content(|w| {
                    bool_el(w, "ProtectTitle", protection.protect_title).map_err(io_shim)?;
                    bool_el(w, "ProtectUserName", protection.protect_username)
                        .map_err(io_shim)?;
                    bool_el(w, "ProtectPassword", protection.protect_password)
                        .map_err(io_shim)?;
                    bool_el(w, "ProtectURL", protection.protect_url).map_err(io_shim)?;
                    bool_el(w, "ProtectNotes", protection.protect_notes).map_err(io_shim)?;
                    Ok::<(), quick_xml::Error>(())
                })
                .map(|_| ())?;
            if !meta.custom_icons.is_empty() {
                w.create_element("CustomIcons")
                    .write_inner_content(|w| {
                        for (uuid, data) in &meta.custom_icons {
                            w.create_element("Icon")
                                .write_inner_content(|w| {
                                    text_el(w, "UUID", &uuid_b64(uuid)).map_err(io_shim)?;
                                    text_el(w, "Data", &b64(data)).map_err(io_shim)?;
                                    Ok::<(), quick_xml::Error>(())
                                })
                                .map(|_| ())?;
                        }
                        Ok::<(), quick_xml::Error>(())
                    })
                    .map(|_| ())?;
            }
            bool_el(w, "RecycleBinEnabled", meta.recycle_bin_enabled).map_err(io_shim)?;
            let bin_uuid = meta.recycle_bin_uuid.unwrap_or(Uuid::nil());
            text_el(w, "RecycleBinUUID", &uuid_b64(&bin_uuid)).map_err(io_shim)?;
            text_el(w, "HistoryMaxItems", &meta.history_max_items.to_string())
                .map_err(io_shim)?;
            text_el(w, "HistoryMaxSize", &meta.history_max_size.to_string())
                .map_err(io_shim)?;
            if !version.is_kdbx4() && !database.binaries.is_empty() {
                w.create_element("Binaries")
                    .write_inner_content(|w| {
                        for (id, binary) in database.binaries.iter().enumerate() {
                            w.create_element("Binary")
                                .with_attribute(("ID", id.to_string().as_str()))
                                .with_attribute(("Compressed", "False"))
                                .write_text_content(BytesText::new(&b64(&binary.data)))
                                .map(|_| ())?;
                        }
                        Ok::<(), quick_xml::Error>(())
                    })
                    .map(|_| ())?;
            }
            if !meta.custom_data.is_empty() {
                w.create_element("CustomData")
                    .write_inner_content(|w| {
                        for (key, value) in &meta.custom_data {
                            w.create_element("Item")
                                .write_inner_content(|w| {
                                    text_el(w, "Key", key).map_err(io_shim)?;
                                    text_el(w, "Value", value).map_err(io_shim)?;
                                    Ok::<(), quick_xml::Error>(())
                                })
                                .map(|_| ())?;
                        }
                        Ok::<(), quick_xml::Error>(())
                    })
                    .map(|_| ())?;
            }
            Ok(())
        })
        .map_err(xml_err)?;
    Ok(())
}

fn write_times(writer: &mut XmlWriter, times: &crate::db::Times, version: FormatVersion) -> Result<()> {
    writer
        .create_element("Times")
        .write_inner_content(|w| {
            text_el(w, "CreationTime", &format_time(&times.creation, version))
                .map_err(io_shim)?;
            text_el(
                w,
                "LastModificationTime",
                &format_time(&times.last_modification, version),
            )
            .map_err(io_shim)?;
            text_el(w, "LastAccessTime", &format_time(&times.last_access, version))
                .map_err(io_shim)?;
            text_el(w, "ExpiryTime", &format_time(&times.expiry, version)).map_err(io_shim)?;
            bool_el(w, "Expires", times.expires).map_err(io_shim)?;
            text_el(w, "UsageCount", &times.usage_count.to_string()).map_err(io_shim)?;
            text_el(
                w,
                "LocationChanged",
                &format_time(&times.location_changed, version),
            )
            .map_err(io_shim)?;
            Ok(())
        })
        .map_err(xml_err)?;
    Ok(())
}

fn write_group(
    writer: &mut XmlWriter,
    database: &Database,
    ctx: &mut XmlContext,
    uuid: Uuid,
) -> Result<()> {
    let group = database
        .group(&uuid)
        .ok_or(Error::GroupNotFound(uuid))?;
    let version = ctx.version;
    writer
        .create_element("Group")
        .write_inner_content(|w| {
            text_el(w, "UUID", &uuid_b64(&group.uuid)).map_err(io_shim)?;
            text_el(w, "Name", &group.name).map_err(io_shim)?;
            text_el(w, "Notes", &group.notes).map_err(io_shim)?;
            text_el(w, "IconID", &group.icon_id.to_string()).map_err(io_shim)?;
            if let Some(icon) = group.custom_icon {
                text_el(w, "CustomIconUUID", &uuid_b64(&icon)).map_err(io_shim)?;
            }
            write_times(w, &group.times, version).map_err(io_shim)?;
            bool_el(w, "IsExpanded", group.is_expanded).map_err(io_shim)?;
            text_el(
                w,
                "DefaultAutoTypeSequence",
                &group.default_auto_type_sequence,
            )
            .map_err(io_shim)?;
            opt_bool_el(w, "EnableAutoType", group.enable_auto_type).map_err(io_shim)?;
            opt_bool_el(w, "EnableSearching", group.enable_searching).map_err(io_shim)?;
            let last_top = group.last_top_visible_entry.unwrap_or(Uuid::nil());
            text_el(w, "LastTopVisibleEntry", &uuid_b64(&last_top)).map_err(io_shim)?;
            for entry_uuid in &group.entries {
                let entry = database
                    .entry(entry_uuid)
                    .ok_or(Error::EntryNotFound(*entry_uuid))
                    .map_err(io_shim)?;
                write_entry(w, database, ctx, entry, true).map_err(io_shim)?;
            }
            for child in &group.groups {
                write_group(w, database, ctx, *child).map_err(io_shim)?;
            }
            Ok(())
        })
        .map_err(xml_err)?;
    Ok(())
}

fn write_entry(
    writer: &mut XmlWriter,
    database: &Database,
    ctx: &mut XmlContext,
    entry: &Entry,
    with_history: bool,
) -> Result<()> {
    let version = ctx.version;
    let protection = database.meta.memory_protection.clone();
    writer
        .create_element("Entry")
        .write_inner_content(|w| {
            text_el(w, "UUID", &uuid_b64(&entry.uuid)).map_err(io_shim)?;
            text_el(w, "IconID", &entry.icon_id.to_string()).map_err(io_shim)?;
            if let Some(icon) = entry.custom_icon {
                text_el(w, "CustomIconUUID", &uuid_b64(&icon)).map_err(io_shim)?;
            }
            text_el(w, "ForegroundColor", &entry.foreground_color).map_err(io_shim)?;
            text_el(w, "BackgroundColor", &entry.background_color).map_err(io_shim)?;
            text_el(w, "OverrideURL", &entry.override_url).map_err(io_shim)?;
            text_el(w, "Tags", &entry.tags.join(";")).map_err(io_shim)?;
            write_times(w, &entry.times, version).map_err(io_shim)?;

            write_string_field(w, ctx, "Title", &entry.title, protection.protect_title)
                .map_err(io_shim)?;
            write_string_field(
                w,
                ctx,
                "UserName",
                &entry.username,
                protection.protect_username,
            )
            .map_err(io_shim)?;
            write_string_field(
                w,
                ctx,
                "Password",
                entry.password(),
                protection.protect_password,
            )
            .map_err(io_shim)?;
            write_string_field(w, ctx, "URL", &entry.url, protection.protect_url)
                .map_err(io_shim)?;
            write_string_field(w, ctx, "Notes", &entry.notes, protection.protect_notes)
                .map_err(io_shim)?;
            for (key, field) in &entry.custom_fields {
                write_string_field(w, ctx, key, &field.value, field.protected)
                    .map_err(io_shim)?;
            }
            for (key, index) in &entry.binaries {
                w.create_element("Binary")
                    .write_inner_content(|w| {
                        text_el(w, "Key", key).map_err(io_shim)?;
                        w.create_element("Value")
                            .with_attribute(("Ref", index.to_string().as_str()))
                            .write_empty()
                            .map(|_| ())
                    })
                    .map(|_| ())?;
            }
            w.create_element("AutoType")
                .write_inner_content(|w| {
                    bool_el(w, "Enabled", entry.auto_type_enabled).map_err(io_shim)?;
                    text_el(w, "DataTransferObfuscation", "0").map_err(io_shim)?;
                    Ok::<(), quick_xml::Error>(())
                })
                .map(|_| ())?;
            if with_history && !entry.history.is_empty() {
                w.create_element("History")
                    .write_inner_content(|w| {
                        for snapshot in &entry.history {
                            write_entry(w, database, ctx, snapshot, false).map_err(io_shim)?;
                        }
                        Ok::<(), quick_xml::Error>(())
                    })
                    .map(|_| ())?;
            }
            Ok(())
        })
        .map_err(xml_err)?;
    Ok(())
}

fn write_string_field(
    writer: &mut XmlWriter,
    ctx: &mut XmlContext,
    key: &str,
    value: &str,
    protected: bool,
) -> Result<()> {
    let encoded;
    let text = if protected {
        let mut bytes = value.as_bytes().to_vec();
        ctx.stream.apply(&mut bytes);
        encoded = b64(&bytes);
        encoded.as_str()
    } else {
        value
    };
    writer
        .create_element("String")
        .write_inner_content(|w| {
            text_el(w, "Key", key).map_err(io_shim)?;
            let element = w.create_element("Value");
            let element = if protected {
                element.with_attribute(("Protected", "True"))
            } else {
                element
            };
            element
                .write_text_content(BytesText::new(text))
                .map(|_| ())
        })
        .map_err(xml_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::inner_stream::{STREAM_ID_CHACHA20, STREAM_ID_NONE};
    use crate::db::EntryBuilder;

    fn round_trip(database: &Database, version: FormatVersion, stream_id: u32) -> ParsedXml {
        let key = [0x61u8; 64];
        let mut enc = InnerStream::new(stream_id, &key).unwrap();
        let mut write_ctx = XmlContext {
            version,
            stream: &mut enc,
        };
        let xml = serialize(database, &mut write_ctx, None).unwrap();
        let text = String::from_utf8(xml).unwrap();

        let mut dec = InnerStream::new(stream_id, &key).unwrap();
        let mut read_ctx = XmlContext {
            version,
            stream: &mut dec,
        };
        parse(&text, &mut read_ctx).unwrap()
    }

    #[test]
    fn protected_fields_survive_round_trip() {
        let mut db = Database::new("Vault");
        db.insert_entry(
            EntryBuilder::new("Mail")
                .username("user")
                .password("deeply secret")
                .custom_field("PIN", CustomField::protected("1234"))
                .build(),
        )
        .unwrap();

        let parsed = round_trip(&db, FormatVersion::Kdbx4, STREAM_ID_CHACHA20);
        let entry = parsed.entries.values().next().unwrap();
        assert_eq!(entry.password(), "deeply secret");
        assert_eq!(entry.custom_fields["PIN"].value, "1234");
        assert!(entry.custom_fields["PIN"].protected);
    }

    #[test]
    fn tree_structure_survives_round_trip() {
        let mut db = Database::new("Vault");
        let work = db.insert_group(Group::new("Work")).unwrap();
        let mut sub = Group::new("Servers");
        sub.parent = Some(work);
        let sub = db.insert_group(sub).unwrap();
        db.insert_entry(EntryBuilder::new("ssh").parent(sub).build())
            .unwrap();

        let parsed = round_trip(&db, FormatVersion::Kdbx4, STREAM_ID_CHACHA20);
        assert_eq!(parsed.groups.len(), 3);
        assert_eq!(parsed.entries.len(), 1);
        let root = parsed.root.unwrap();
        assert_eq!(parsed.groups[&root].name, "Vault");
        let entry = parsed.entries.values().next().unwrap();
        assert_eq!(parsed.groups[&entry.parent.unwrap()].name, "Servers");
    }

    #[test]
    fn history_round_trips_without_nested_history() {
        let mut db = Database::new("Vault");
        let mut entry = EntryBuilder::new("rotating").password("v2").build();
        let mut old = entry.clone();
        old.set_password("v1");
        entry.history.push(old);
        db.insert_entry(entry).unwrap();

        let parsed = round_trip(&db, FormatVersion::Kdbx4, STREAM_ID_CHACHA20);
        let entry = parsed.entries.values().next().unwrap();
        assert_eq!(entry.history.len(), 1);
        assert_eq!(entry.history[0].password(), "v1");
        assert!(entry.history[0].history.is_empty());
    }

    #[test]
    fn v3_times_are_readable_text() {
        let mut db = Database::new("Vault");
        db.insert_entry(Entry::new("x")).unwrap();
        let key = [1u8; 32];
        let mut stream = InnerStream::new(STREAM_ID_NONE, &key).unwrap();
        let mut ctx = XmlContext {
            version: FormatVersion::Kdbx31,
            stream: &mut stream,
        };
        let xml = String::from_utf8(serialize(&db, &mut ctx, Some("deadbeef")).unwrap()).unwrap();
        assert!(xml.contains("<HeaderHash>deadbeef</HeaderHash>"));
        // RFC 3339, not base64
        assert!(xml.contains("T") && xml.contains("Z</CreationTime>"));
    }

    #[test]
    fn meta_custom_data_round_trips() {
        let mut db = Database::new("Vault");
        db.meta
            .custom_data
            .insert("sync-id".into(), "abc123".into());
        let parsed = round_trip(&db, FormatVersion::Kdbx4, STREAM_ID_CHACHA20);
        assert_eq!(parsed.meta.custom_data["sync-id"], "abc123");
    }

    #[test]
    fn malformed_document_is_rejected() {
        let key = [1u8; 32];
        let mut stream = InnerStream::new(STREAM_ID_NONE, &key).unwrap();
        let mut ctx = XmlContext {
            version: FormatVersion::Kdbx4,
            stream: &mut stream,
        };
        assert!(parse("<NotKeePass/>", &mut ctx).is_err());
    }
}
