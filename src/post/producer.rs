//! Segment production: lazy file slicing and yEnc article framing
//!
//! A `FileSet` owns one open handle per input file and serves framed,
//! encoded parts on demand. Only the requested slice is ever read; a
//! multi-gigabyte posting never holds more than one article in memory
//! per connection.

use bytes::Bytes;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{PostError, Result};
use crate::post::article::{Article, ArticleHeader, SegmentKey};
use crate::yenc;

struct PostFile {
    path: PathBuf,
    name: String,
    size: u64,
    pieces: u32,
    handle: File,
}

/// The ordered set of files being posted, sliced into fixed-size pieces.
pub struct FileSet {
    article_size: usize,
    line_length: usize,
    files: Vec<PostFile>,
}

impl FileSet {
    pub fn new(article_size: usize, line_length: usize) -> Self {
        Self {
            article_size,
            line_length,
            files: Vec::new(),
        }
    }

    /// Register a regular file. Returns its piece count.
    pub fn add_file<P: AsRef<Path>>(&mut self, path: P) -> Result<u32> {
        let path = path.as_ref().to_path_buf();
        let handle = File::open(&path)?;
        let size = handle.metadata()?.len();
        let pieces = size.div_ceil(self.article_size as u64) as u32;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());

        self.files.push(PostFile {
            path,
            name,
            size,
            pieces,
            handle,
        });
        Ok(pieces)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn file_name(&self, file_index: u32) -> &str {
        &self.files[file_index as usize].name
    }

    pub fn file_size(&self, file_index: u32) -> u64 {
        self.files[file_index as usize].size
    }

    pub fn piece_count(&self, file_index: u32) -> u32 {
        self.files[file_index as usize].pieces
    }

    pub fn total_pieces(&self) -> u64 {
        self.files.iter().map(|f| u64::from(f.pieces)).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Every `(file, piece)` key of the set, file-major order.
    pub fn keys(&self) -> impl Iterator<Item = SegmentKey> + '_ {
        self.files.iter().enumerate().flat_map(|(i, f)| {
            (0..f.pieces).map(move |p| SegmentKey::new(i as u32, p))
        })
    }

    /// `<subject> [i+1/F] - "<basename>" yEnc (p+1/P)`
    pub fn subject(&self, base: &str, key: SegmentKey) -> String {
        format!(
            "{} [{}/{}] - \"{}\" yEnc ({}/{})",
            base,
            key.file_index + 1,
            self.file_count(),
            self.file_name(key.file_index),
            key.piece_index + 1,
            self.piece_count(key.file_index)
        )
    }

    fn read_slice(&mut self, key: SegmentKey) -> Result<Vec<u8>> {
        let article_size = self.article_size as u64;
        let file = &mut self.files[key.file_index as usize];
        let offset = u64::from(key.piece_index) * article_size;
        let len = article_size.min(file.size.saturating_sub(offset)) as usize;

        let path = file.path.clone();
        let mut buf = vec![0u8; len];
        file.handle
            .seek(SeekFrom::Start(offset))
            .map_err(|source| PostError::SegmentRead {
                path: path.clone(),
                piece: key.piece_index,
                source,
            })?;
        file.handle
            .read_exact(&mut buf)
            .map_err(|source| PostError::SegmentRead {
                path,
                piece: key.piece_index,
                source,
            })?;
        Ok(buf)
    }

    /// Produce the framed yEnc body of one piece:
    /// `=ybegin` / `=ypart` header lines, the encoded slice, and the
    /// `=yend` trailer carrying the CRC-32 of the raw slice.
    pub fn encode_part(&mut self, key: SegmentKey) -> Result<Bytes> {
        let raw = self.read_slice(key)?;
        let crc = crc32fast::hash(&raw);

        let file = &self.files[key.file_index as usize];
        let offset = u64::from(key.piece_index) * self.article_size as u64;

        let mut out = Vec::with_capacity(raw.len() + raw.len() / 32 + 256);
        out.extend_from_slice(
            format!(
                "=ybegin part={} total={} line={} size={} name={}\r\n",
                key.piece_index + 1,
                file.pieces,
                self.line_length,
                file.size,
                file.name
            )
            .as_bytes(),
        );
        out.extend_from_slice(
            format!(
                "=ypart begin={} end={}\r\n",
                offset + 1,
                offset + raw.len() as u64
            )
            .as_bytes(),
        );
        yenc::encode_into(&raw, self.line_length, &mut out);
        out.extend_from_slice(
            format!(
                "=yend size={} part={} pcrc32={:X}\r\n",
                raw.len(),
                key.piece_index + 1,
                crc
            )
            .as_bytes(),
        );
        Ok(Bytes::from(out))
    }

    /// Assemble the complete article for one piece.
    pub fn build_article(
        &mut self,
        key: SegmentKey,
        message_id: String,
        from: &str,
        base_subject: &str,
        groups: &[String],
    ) -> Result<Article> {
        let subject = self.subject(base_subject, key);
        let payload = self.encode_part(key)?;

        let header = ArticleHeader {
            from: from.to_string(),
            subject,
            message_id,
            newsgroups: groups.to_vec(),
            extra: vec![(
                "X-Newsposter".to_string(),
                format!("ul-nzb/{}", env!("CARGO_PKG_VERSION")),
            )],
        };
        let mut article = Article::new(header);
        article.push_payload(payload);
        Ok(article)
    }
}
