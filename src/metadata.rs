use crate::bencode::{self, BencodeError, Value};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MetadataError {
    #[error("info dict is not valid bencode: {0}")]
    Bencode(#[from] BencodeError),
    #[error("info dict is not a dictionary")]
    NotADict,
    #[error("missing or invalid field `{0}`")]
    Field(&'static str),
    #[error("`{0}` is not valid UTF-8")]
    NotUtf8(&'static str),
    #[error("negative file size")]
    NegativeSize,
    #[error("empty file path")]
    EmptyPath,
    #[error("total size overflows u64")]
    SizeOverflow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    /// Components joined with `/`.
    pub path: String,
    pub size: u64,
}

/// Decoded torrent description. Only built from an info dict whose SHA1 has
/// already been checked against `info_hash`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMetadata {
    pub info_hash: [u8; 20],
    pub name: String,
    pub files: Vec<File>,
    pub total_size: u64,
    /// Unix seconds.
    pub discovered_on: i64,
}

impl TorrentMetadata {
    pub fn hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn decode(info_hash: [u8; 20], raw: &[u8]) -> Result<Self, MetadataError> {
        let info = bencode::decode(raw)?;
        if info.as_dict().is_none() {
            return Err(MetadataError::NotADict);
        }

        let name = utf8_field(&info, b"name.utf-8", b"name", "name")?;

        let files = match info.get(b"files") {
            Some(list) => {
                let list = list.as_list().ok_or(MetadataError::Field("files"))?;
                let mut files = Vec::with_capacity(list.len());
                for entry in list {
                    if let Some(file) = decode_file(entry)? {
                        files.push(file);
                    }
                }
                files
            }
            None => vec![File {
                path: name.clone(),
                size: size_field(&info, "length")?,
            }],
        };

        let total_size = files
            .iter()
            .try_fold(0u64, |acc, f| acc.checked_add(f.size))
            .ok_or(MetadataError::SizeOverflow)?;
        let discovered_on = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        Ok(Self {
            info_hash,
            name,
            files,
            total_size,
            discovered_on,
        })
    }
}

/// One `files` entry; `None` for BEP-47 padding files.
fn decode_file(entry: &Value<'_>) -> Result<Option<File>, MetadataError> {
    if entry.as_dict().is_none() {
        return Err(MetadataError::Field("files"));
    }

    let is_padding = entry
        .get(b"attr")
        .and_then(Value::as_bytes)
        .is_some_and(|attr| attr.contains(&b'p'));
    if is_padding {
        return Ok(None);
    }

    let size = size_field(entry, "length")?;

    let preferred = entry.get(b"path.utf-8").map(path_components);
    let parts = match preferred {
        Some(Ok(parts)) => parts,
        _ => match entry.get(b"path") {
            Some(plain) => path_components(plain)?,
            None => return Err(preferred.and_then(Result::err).unwrap_or(MetadataError::Field("path"))),
        },
    };
    if parts.is_empty() || parts.iter().all(|p| p.is_empty()) {
        return Err(MetadataError::EmptyPath);
    }

    Ok(Some(File {
        path: parts.join("/"),
        size,
    }))
}

fn path_components<'a>(list: &Value<'a>) -> Result<Vec<&'a str>, MetadataError> {
    let components = list.as_list().ok_or(MetadataError::Field("path"))?;
    let mut parts = Vec::with_capacity(components.len());
    for c in components {
        let bytes = c.as_bytes().ok_or(MetadataError::Field("path"))?;
        parts.push(std::str::from_utf8(bytes).map_err(|_| MetadataError::NotUtf8("path"))?);
    }
    Ok(parts)
}

/// `preferred` wins when it is valid UTF-8; otherwise `fallback` is used.
fn utf8_field(
    dict: &Value<'_>,
    preferred: &[u8],
    fallback: &[u8],
    label: &'static str,
) -> Result<String, MetadataError> {
    let preferred = dict.get(preferred);
    if let Some(s) = preferred.and_then(Value::as_str) {
        return Ok(s.to_owned());
    }
    match dict.get(fallback).and_then(Value::as_bytes) {
        Some(bytes) => std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| MetadataError::NotUtf8(label)),
        None if preferred.and_then(Value::as_bytes).is_some() => Err(MetadataError::NotUtf8(label)),
        None => Err(MetadataError::Field(label)),
    }
}

fn size_field(dict: &Value<'_>, key: &'static str) -> Result<u64, MetadataError> {
    let n = dict
        .get(key.as_bytes())
        .and_then(Value::as_int)
        .ok_or(MetadataError::Field(key))?;
    u64::try_from(n).map_err(|_| MetadataError::NegativeSize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_file() {
        let m = TorrentMetadata::decode([1; 20], b"d6:lengthi1024e4:name8:demo.isoe").unwrap();
        assert_eq!(m.name, "demo.iso");
        assert_eq!(
            m.files,
            vec![File {
                path: "demo.iso".into(),
                size: 1024
            }]
        );
        assert_eq!(m.total_size, 1024);
        assert!(m.discovered_on > 0);
    }

    #[test]
    fn multi_file_prefers_utf8_variants_and_skips_padding() {
        let raw: &[u8] = b"d5:filesl\
            d6:lengthi10e4:pathl3:old5:a.txte10:path.utf-8l3:dir5:a.txtee\
            d4:attr1:p6:lengthi6e4:pathl4:.pad1:6ee\
            d6:lengthi5e4:pathl5:b.binee\
            e4:name3:raw10:name.utf-85:Nice!e";
        let m = TorrentMetadata::decode([2; 20], raw).unwrap();
        assert_eq!(m.name, "Nice!");
        let paths: Vec<&str> = m.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["dir/a.txt", "b.bin"]);
        assert_eq!(m.total_size, 15);
    }

    #[test]
    fn rejects_structural_violations() {
        let cases: [(&[u8], MetadataError); 6] = [
            (b"le", MetadataError::NotADict),
            (b"d6:lengthi1ee", MetadataError::Field("name")),
            (b"d4:name1:xe", MetadataError::Field("length")),
            (b"d6:lengthi-1e4:name1:xe", MetadataError::NegativeSize),
            (b"d5:filesld6:lengthi1e4:pathleee4:name1:xe", MetadataError::EmptyPath),
            (b"d6:lengthi1e4:name2:\xff\xfee", MetadataError::NotUtf8("name")),
        ];
        for (raw, want) in cases {
            assert_eq!(TorrentMetadata::decode([0; 20], raw), Err(want), "{:?}", raw);
        }
    }

    #[test]
    fn file_sizes_that_overflow_u64_are_rejected() {
        let raw: &[u8] = b"d5:filesl\
            d6:lengthi9223372036854775807e4:pathl1:aee\
            d6:lengthi9223372036854775807e4:pathl1:bee\
            d6:lengthi9223372036854775807e4:pathl1:cee\
            e4:name1:xe";
        assert_eq!(TorrentMetadata::decode([3; 20], raw), Err(MetadataError::SizeOverflow));
    }

    #[test]
    fn invalid_utf8_variants_fall_back_to_plain_keys() {
        let raw: &[u8] = b"d5:filesl\
            d6:lengthi4e4:pathl3:dir5:c.txte10:path.utf-8l2:\xff\xfeee\
            e4:name4:good10:name.utf-82:\xc3\x28e";
        let m = TorrentMetadata::decode([4; 20], raw).unwrap();
        assert_eq!(m.name, "good");
        assert_eq!(m.files[0].path, "dir/c.txt");

        // No plain key to fall back to.
        assert_eq!(
            TorrentMetadata::decode([4; 20], b"d6:lengthi1e10:name.utf-81:\xffe"),
            Err(MetadataError::NotUtf8("name"))
        );
    }

    #[test]
    fn bencode_errors_propagate() {
        assert!(matches!(
            TorrentMetadata::decode([0; 20], b"d4:name"),
            Err(MetadataError::Bencode(_))
        ));
    }
}
