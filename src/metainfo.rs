//! Parsing of the `.torrent` metainfo file into the in-memory representation
//! the rest of the engine works with.
//!
//! Parsing happens in two stages: the bencoded dictionary is first
//! deserialized verbatim into [`RawMetainfo`] (so that `info_hash` can be
//! computed from the exact bytes of the `info` dictionary, per BEP-3), and is
//! then lowered into [`Metainfo`], the flattened, engine-facing type that
//! [`crate::storage_info::StorageInfo`] is built from.

use serde_bytes::ByteBuf;

use crate::{
    error::{Error, Result},
    storage_info::{FileInfo, FsStructure},
    Sha1Hash,
};

/// The bencoded `.torrent` file, deserialized as closely to the wire format
/// as possible.
#[derive(Debug, Deserialize)]
pub(crate) struct RawMetainfo {
    pub announce: String,
    pub info: RawInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RawInfo {
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    pub length: Option<u64>,
    pub files: Option<Vec<RawFile>>,
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RawFile {
    pub path: Vec<String>,
    pub length: u64,
}

/// The parsed, immutable descriptor of a torrent.
///
/// Created once from the bytes of a `.torrent` file and never mutated for
/// the life of the torrent; every other component is derived from it.
#[derive(Clone, Debug)]
pub struct Metainfo {
    /// The announce URL of the torrent's tracker.
    pub tracker_url: String,
    /// The name of the torrent. Used as the download directory name for
    /// multi-file torrents.
    pub name: String,
    /// The nominal length of a piece, in bytes.
    pub piece_len: u32,
    /// The concatenation of the SHA-1 hash of each piece, 20 bytes each.
    pub pieces: Vec<u8>,
    /// The info hash of the torrent: the SHA-1 digest of the bencoded `info`
    /// dictionary, computed once and cached here.
    pub info_hash: Sha1Hash,
    /// The file(s) the torrent describes, relative to the download
    /// directory.
    pub structure: FsStructure,
}

impl Metainfo {
    /// Parses a `.torrent` file's raw bytes into a [`Metainfo`].
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawMetainfo) -> Result<Self> {
        if raw.info.pieces.len() % 20 != 0 {
            return Err(Error::MetainfoInconsistent);
        }

        let structure = if let Some(files) = &raw.info.files {
            let mut torrent_offset = 0;
            let mut infos = Vec::with_capacity(files.len());
            for file in files {
                infos.push(FileInfo {
                    path: file.path.iter().collect(),
                    len: file.length,
                    torrent_offset,
                });
                torrent_offset += file.length;
            }
            FsStructure::Archive { files: infos }
        } else {
            let len = raw.info.length.ok_or(Error::MetainfoInconsistent)?;
            FsStructure::File(FileInfo {
                path: std::path::PathBuf::from(&raw.info.name),
                len,
                torrent_offset: 0,
            })
        };

        let download_len = structure.download_len();
        let piece_count = raw.info.pieces.len() / 20;
        if piece_count == 0 {
            return Err(Error::MetainfoInconsistent);
        }
        let expected_piece_count = ((download_len + raw.info.piece_length as u64 - 1)
            / raw.info.piece_length as u64) as usize;
        if expected_piece_count != piece_count {
            return Err(Error::MetainfoInconsistent);
        }

        let info_hash = Self::hash_info(&raw)?;

        Ok(Self {
            tracker_url: raw.announce,
            name: raw.info.name,
            piece_len: raw.info.piece_length,
            pieces: raw.info.pieces,
            info_hash,
            structure,
        })
    }

    /// Computes the SHA-1 digest of the canonically bencoded `info`
    /// dictionary. This is invariant: re-loading the same `.torrent` bytes
    /// always yields the same info hash.
    fn hash_info(raw: &RawMetainfo) -> Result<Sha1Hash> {
        use sha1::{Digest, Sha1};

        #[derive(Serialize)]
        struct InfoForHashing<'a> {
            name: &'a str,
            #[serde(rename = "piece length")]
            piece_length: u32,
            pieces: ByteBuf,
            #[serde(skip_serializing_if = "Option::is_none")]
            length: Option<u64>,
            #[serde(skip_serializing_if = "Option::is_none")]
            files: Option<&'a Vec<RawFile>>,
        }

        let info = InfoForHashing {
            name: &raw.info.name,
            piece_length: raw.info.piece_length,
            pieces: ByteBuf::from(raw.info.pieces.clone()),
            length: raw.info.length,
            files: raw.info.files.as_ref(),
        };
        let bytes = serde_bencode::to_bytes(&info)?;
        let digest = Sha1::digest(&bytes);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// Returns the total number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }

    /// Returns the expected SHA-1 hash of the piece at `index`.
    pub(crate) fn piece_hash(&self, index: crate::PieceIndex) -> Option<&[u8]> {
        let start = index * 20;
        self.pieces.get(start..start + 20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_bytes() -> Vec<u8> {
        // a minimal single-file torrent: one 10 byte file, piece length 10
        let mut buf = Vec::new();
        buf.extend_from_slice(
            b"d8:announce3:url4:infod6:lengthi10e4:name5:a.txt12:piece lengthi10e6:pieces20:",
        );
        buf.extend_from_slice(&[0u8; 20]);
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn parses_single_file_torrent() {
        let metainfo = Metainfo::from_bytes(&single_file_bytes()).unwrap();
        assert_eq!(metainfo.tracker_url, "url");
        assert_eq!(metainfo.name, "a.txt");
        assert_eq!(metainfo.piece_len, 10);
        assert_eq!(metainfo.piece_count(), 1);
        assert!(!metainfo.structure.is_archive());
    }

    #[test]
    fn info_hash_is_deterministic() {
        let bytes = single_file_bytes();
        let a = Metainfo::from_bytes(&bytes).unwrap();
        let b = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(a.info_hash, b.info_hash);
    }

    #[test]
    fn rejects_inconsistent_piece_count() {
        // pieces hash string covers 1 piece, but length implies 2
        let mut buf = Vec::new();
        buf.extend_from_slice(
            b"d8:announce3:url4:infod6:lengthi20e4:name5:a.txt12:piece lengthi10e6:pieces20:",
        );
        buf.extend_from_slice(&[0u8; 20]);
        buf.extend_from_slice(b"ee");
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::MetainfoInconsistent)
        ));
    }
}
