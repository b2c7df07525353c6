//! Reading Logiqx-style DAT files.
//!
//! The catalog consumes parsing through the [`DatParser`] trait; the
//! default implementation walks the XML event stream and hashes the raw
//! file bytes for the dat identity.

use std::fs;
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use sha1::{Digest, Sha1};

use crate::error::Result;
use crate::model::{Dat, Game, Rom, CRC_SIZE, MD5_SIZE, SHA1_SIZE};

/// Turns a DAT file into a [`Dat`] plus the SHA1 identity of its bytes.
pub trait DatParser: Send + Sync {
    /// Parse the file at `path`.
    fn parse(&self, path: &Path) -> Result<(Dat, Vec<u8>)>;
}

/// The Logiqx XML reader: `<header>` fields, `<game>`/`<machine>` elements
/// and their `<rom>` attributes.
#[derive(Debug, Clone, Default)]
pub struct XmlDatParser;

impl XmlDatParser {
    /// Parse DAT bytes; `path` is recorded on the resulting dat.
    pub fn parse_bytes(&self, bytes: &[u8], path: &Path) -> Result<Dat> {
        let mut reader = Reader::from_reader(bytes);
        let mut buf = Vec::new();

        let mut dat = Dat {
            path: path.to_string_lossy().into_owned(),
            ..Dat::default()
        };
        let mut in_header = false;
        let mut game: Option<Game> = None;
        let mut text_tag: Vec<u8> = Vec::new();

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(e) => match e.name().as_ref() {
                    b"header" => in_header = true,
                    b"game" | b"machine" => {
                        game = Some(Game {
                            name: attr(&e, b"name")?.unwrap_or_default(),
                            ..Game::default()
                        });
                    }
                    b"rom" => {
                        if let Some(game) = game.as_mut() {
                            if let Some(rom) = read_rom(&e)? {
                                game.roms.push(rom);
                            }
                        }
                    }
                    tag => text_tag = tag.to_vec(),
                },
                Event::Empty(e) => {
                    if e.name().as_ref() == b"rom" {
                        if let Some(game) = game.as_mut() {
                            if let Some(rom) = read_rom(&e)? {
                                game.roms.push(rom);
                            }
                        }
                    }
                }
                Event::Text(t) => {
                    let text = t.unescape()?;
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    if in_header {
                        match text_tag.as_slice() {
                            b"name" => dat.name = text.to_owned(),
                            b"description" => dat.description = text.to_owned(),
                            b"version" => dat.version = text.to_owned(),
                            b"author" => dat.author = text.to_owned(),
                            b"category" => dat.category = text.to_owned(),
                            _ => {}
                        }
                    } else if let Some(game) = game.as_mut() {
                        if text_tag == b"description" {
                            game.description = text.to_owned();
                        }
                    }
                }
                Event::End(e) => match e.name().as_ref() {
                    b"header" => in_header = false,
                    b"game" | b"machine" => {
                        if let Some(game) = game.take() {
                            dat.games.push(game);
                        }
                    }
                    _ => text_tag.clear(),
                },
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        Ok(dat)
    }
}

impl DatParser for XmlDatParser {
    fn parse(&self, path: &Path) -> Result<(Dat, Vec<u8>)> {
        let bytes = fs::read(path)?;
        let sha1 = Sha1::digest(&bytes).to_vec();
        let dat = self.parse_bytes(&bytes, path)?;
        Ok((dat, sha1))
    }
}

fn attr(e: &BytesStart<'_>, want: &[u8]) -> Result<Option<String>> {
    for a in e.attributes() {
        let a = a.map_err(quick_xml::Error::from)?;
        if a.key.as_ref() == want {
            return Ok(Some(a.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// Decode one `<rom .../>` element. Roms carrying no usable hash (nodump
/// entries) are dropped.
fn read_rom(e: &BytesStart<'_>) -> Result<Option<Rom>> {
    let mut rom = Rom::default();
    for a in e.attributes() {
        let a = a.map_err(quick_xml::Error::from)?;
        let value = a.unescape_value()?;
        match a.key.as_ref() {
            b"name" => rom.name = value.into_owned(),
            b"size" => rom.size = value.trim().parse().unwrap_or(0),
            b"crc" => rom.crc = hash_attr(&value, CRC_SIZE),
            b"md5" => rom.md5 = hash_attr(&value, MD5_SIZE),
            b"sha1" => rom.sha1 = hash_attr(&value, SHA1_SIZE),
            _ => {}
        }
    }
    if rom.has_hash() {
        Ok(Some(rom))
    } else {
        Ok(None)
    }
}

fn hash_attr(value: &str, want: usize) -> Option<Vec<u8>> {
    let decoded = hex::decode(value.trim()).ok()?;
    if decoded.len() == want {
        Some(decoded)
    } else {
        None
    }
}
