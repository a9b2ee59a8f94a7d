//! File I/O: reads over the write-cache overlay, buffered writes and the
//! commit pipeline.
//!
//! Writes land in the share's write cache and reach the payload store only
//! on commit. A commit materializes the new file image under a fresh
//! content key (whole-object for small files, streamed through the
//! incremental-write extension for staged sets of 5 MiB and above) and
//! then swaps the inode's content reference atomically. The old key is
//! deleted after the swap with zero grace; payload stores with eventual
//! deletes must tolerate reads racing a delete.
//!
//! Reads see the overlay of staged bytes over committed content, so a
//! client observes its own uncommitted writes and, after a commit, every
//! client on every protocol observes the committed image.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::write::StagedSnapshot;
use crate::engine::{Access, Engine, LockRange, OpContext};
use crate::error::{EngineError, EngineResult};
use crate::inode::{FileTime, InodeId, InodeKind};
use crate::share::BlockedOp;
use crate::store::{ContentId, IncrementalWrite, MetaStore, PayloadStore};

/// Whole objects up to this size are fetched completely and read-cached;
/// larger objects are range-read without caching.
const SMALL_OBJECT: u64 = 1024 * 1024;

/// Chunk size for streamed commits.
const STREAM_CHUNK: usize = 1024 * 1024;

/// Stability requested by a write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Stability {
    Unstable,
    DataSync,
    FileSync,
}

impl Engine {
    /// Reads a byte range, overlaying staged writes on committed content.
    pub async fn read(
        &self,
        ctx: &OpContext,
        id: InodeId,
        offset: u64,
        len: usize,
    ) -> EngineResult<(Vec<u8>, bool)> {
        self.require_unblocked(ctx, BlockedOp::Read)?;
        self.require_read(ctx)?;
        let attrs = self.store(ctx, ctx.share.meta.get_attr(id)).await?;
        match attrs.kind {
            InodeKind::Regular => {}
            InodeKind::Directory => return Err(EngineError::IsDir),
            _ => return Err(EngineError::Invalid),
        }
        self.access_check(ctx, id, &attrs, Access::Read).await?;
        if self.locks().io_conflict(
            ctx.file(id),
            ctx.client,
            LockRange::new(offset, len as u64),
            false,
        ) {
            return Err(EngineError::Denied);
        }

        let staged = ctx.share.write_cache.snapshot(id);
        let effective = attrs.size.max(staged.as_ref().map(|s| s.high_water).unwrap_or(0));
        if offset >= effective {
            return Ok((Vec::new(), true));
        }
        let want = (len as u64).min(effective - offset) as usize;
        let content = self.store(ctx, ctx.share.meta.get_content(id)).await?;
        let mut buf = self.base_window(ctx, &content, offset, want).await?;
        if let Some(snap) = &staged {
            overlay(&mut buf, offset, &snap.ranges);
        }
        let eof = offset + want as u64 >= effective;

        // best-effort access time bump; never fatal
        let _ = self
            .store(
                ctx,
                ctx.share.meta.set_attr(id, &crate::inode::SetAttrPatch::touch_atime()),
            )
            .await;
        Ok((buf, eof))
    }

    /// Stages a write and commits per policy.
    ///
    /// Commit triggers honoured here: stable writes, the per-inode staged
    /// size crossing the multipart threshold (when the payload store can
    /// stream), and the arena ceiling (which synchronously commits the
    /// largest entry to shed pressure).
    pub async fn write(
        &self,
        ctx: &OpContext,
        id: InodeId,
        offset: u64,
        data: &[u8],
        stability: Stability,
    ) -> EngineResult<(u32, [u8; 8])> {
        self.require_unblocked(ctx, BlockedOp::Write)?;
        self.require_write(ctx)?;
        let attrs = self.store(ctx, ctx.share.meta.get_attr(id)).await?;
        match attrs.kind {
            InodeKind::Regular => {}
            InodeKind::Directory => return Err(EngineError::IsDir),
            _ => return Err(EngineError::Invalid),
        }
        self.access_check(ctx, id, &attrs, Access::Write).await?;
        if self.locks().io_conflict(
            ctx.file(id),
            ctx.client,
            LockRange::new(offset, data.len() as u64),
            true,
        ) {
            return Err(EngineError::Denied);
        }

        let pressure = ctx.share.write_cache.stage(id, offset, data);
        match pressure {
            crate::cache::WritePressure::Ceiling => {
                if let Some(victim) = ctx.share.write_cache.largest() {
                    debug!(trace = ctx.trace, victim = %victim, "write ceiling, committing victim");
                    self.commit(ctx, victim).await?;
                }
            }
            crate::cache::WritePressure::CommitThreshold => {
                if ctx.share.payload.incremental().is_some() {
                    self.commit(ctx, id).await?;
                }
            }
            crate::cache::WritePressure::None => {}
        }
        if stability != Stability::Unstable {
            self.commit(ctx, id).await?;
        }
        Ok((data.len() as u32, self.write_verifier()))
    }

    /// Commits an inode's staged writes to the payload store.
    ///
    /// Commits of one inode serialize; writes staged while a commit runs
    /// join the next one. On failure the staged bytes are retained for a
    /// bounded time so a retried commit can succeed, and the inode's
    /// content reference is left unchanged.
    pub async fn commit(&self, ctx: &OpContext, id: InodeId) -> EngineResult<[u8; 8]> {
        self.require_unblocked(ctx, BlockedOp::Commit)?;
        let cache = &ctx.share.write_cache;
        let Some(entry) = cache.peek(id) else {
            return Ok(self.write_verifier());
        };
        let _gate = entry.begin_commit().await;
        let Some(snap) = cache.snapshot(id) else {
            return Ok(self.write_verifier());
        };
        match self.commit_snapshot(ctx, id, &snap).await {
            Ok(()) => {
                cache.commit_finished(id, snap.seq);
                Ok(self.write_verifier())
            }
            Err(err) => {
                warn!(trace = ctx.trace, inode = %id, ?err, "commit failed, retaining staged bytes");
                cache.commit_failed(id);
                Err(if err.is_transient() { EngineError::Io } else { err })
            }
        }
    }

    async fn commit_snapshot(
        &self,
        ctx: &OpContext,
        id: InodeId,
        snap: &StagedSnapshot,
    ) -> EngineResult<()> {
        let meta = &ctx.share.meta;
        let payload = &ctx.share.payload;
        let current = self.store(ctx, meta.get_content(id)).await?;
        let old_size = current.as_ref().map(|(_, size)| *size).unwrap_or(0);
        let new_size = old_size.max(snap.high_water);
        let staged_total: u64 = snap.ranges.iter().map(|(_, b)| b.len() as u64).sum();
        let new_key = ContentId::fresh(ctx.share.name());

        let threshold = ctx.share.write_cache.config().commit_threshold;
        let incremental = payload.incremental();
        let materialized = if staged_total < threshold || incremental.is_none() {
            let mut buf = match &current {
                Some((key, _)) => self.store_retry(ctx, || payload.get(key)).await?,
                None => Vec::new(),
            };
            buf.resize(new_size as usize, 0);
            for (off, bytes) in &snap.ranges {
                buf[*off as usize..][..bytes.len()].copy_from_slice(bytes);
            }
            self.store_retry(ctx, || payload.put(&new_key, &buf)).await?;
            Some(buf)
        } else {
            let inc = incremental.expect("checked above");
            let session = self.store(ctx, inc.begin(&new_key)).await?;
            let mut off = 0u64;
            loop {
                if off >= new_size {
                    break;
                }
                let chunk_len = STREAM_CHUNK.min((new_size - off) as usize);
                let chunk = match self.base_window(ctx, &current, off, chunk_len).await {
                    Ok(mut chunk) => {
                        overlay(&mut chunk, off, &snap.ranges);
                        chunk
                    }
                    Err(err) => {
                        let _ = self.store(ctx, inc.abort(session)).await;
                        return Err(err);
                    }
                };
                if let Err(err) = self.store(ctx, inc.append(session, &chunk)).await {
                    let _ = self.store(ctx, inc.abort(session)).await;
                    return Err(err);
                }
                off += chunk_len as u64;
            }
            if let Err(err) = self.store(ctx, inc.finish(session)).await {
                let _ = self.store(ctx, inc.abort(session)).await;
                return Err(err);
            }
            None
        };

        let now = FileTime::now();
        let old_key = match self
            .store(ctx, meta.set_content(id, Some(new_key.clone()), new_size, now, now))
            .await
        {
            Ok(old) => old,
            Err(err) => {
                // content reference unchanged; drop the orphaned upload
                self.delete_payload_best_effort(ctx, new_key);
                return Err(err);
            }
        };
        if let (Some(rc), Some(buf)) = (&ctx.share.read_cache, materialized) {
            rc.insert(new_key, Arc::new(buf));
        }
        if let Some(old) = old_key {
            self.delete_payload_best_effort(ctx, old);
        }
        Ok(())
    }

    /// Truncates or extends a regular file to `new_size`, folding staged
    /// writes into the rewritten content.
    pub(crate) async fn set_size(
        &self,
        ctx: &OpContext,
        id: InodeId,
        new_size: u64,
    ) -> EngineResult<()> {
        let cache = &ctx.share.write_cache;
        let entry = cache.entry(id);
        let _gate = entry.begin_commit().await;
        let snap = cache.snapshot(id);
        let current = self.store(ctx, ctx.share.meta.get_content(id)).await?;

        let now = FileTime::now();
        let old_key = if new_size == 0 {
            self.store(ctx, ctx.share.meta.set_content(id, None, 0, now, now)).await?
        } else {
            let mut buf = self.base_window(ctx, &current, 0, new_size as usize).await?;
            if let Some(snap) = &snap {
                overlay(&mut buf, 0, &snap.ranges);
            }
            let new_key = ContentId::fresh(ctx.share.name());
            let payload = &ctx.share.payload;
            self.store_retry(ctx, || payload.put(&new_key, &buf)).await?;
            let old = self
                .store(ctx, ctx.share.meta.set_content(id, Some(new_key.clone()), new_size, now, now))
                .await?;
            if let Some(rc) = &ctx.share.read_cache {
                rc.insert(new_key, Arc::new(buf));
            }
            old
        };
        if let Some(snap) = snap {
            cache.commit_finished(id, snap.seq);
        }
        if let Some(old) = old_key {
            self.delete_payload_best_effort(ctx, old);
        }
        Ok(())
    }

    /// Fetches `[offset, offset + len)` of the committed content,
    /// zero-padded past the end. Small objects come through the read
    /// cache whole; large objects are range-read.
    async fn base_window(
        &self,
        ctx: &OpContext,
        content: &Option<(ContentId, u64)>,
        offset: u64,
        len: usize,
    ) -> EngineResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let Some((key, size)) = content else { return Ok(buf) };
        if offset >= *size || len == 0 {
            return Ok(buf);
        }
        let avail = ((*size - offset) as usize).min(len);
        let payload = &ctx.share.payload;

        if let Some(rc) = &ctx.share.read_cache {
            if let Some(blob) = rc.get(key) {
                let start = (offset as usize).min(blob.len());
                let end = (start + avail).min(blob.len());
                buf[..end - start].copy_from_slice(&blob[start..end]);
                return Ok(buf);
            }
            if *size <= SMALL_OBJECT {
                let blob = self.store_retry(ctx, || payload.get(key)).await?;
                let blob = Arc::new(blob);
                rc.insert(key.clone(), blob.clone());
                let start = (offset as usize).min(blob.len());
                let end = (start + avail).min(blob.len());
                buf[..end - start].copy_from_slice(&blob[start..end]);
                return Ok(buf);
            }
        }
        let bytes = self.store_retry(ctx, || payload.get_range(key, offset, avail)).await?;
        let n = bytes.len().min(len);
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok(buf)
    }
}

/// Copies the staged ranges intersecting the window onto it.
fn overlay(buf: &mut [u8], window_off: u64, ranges: &[(u64, Vec<u8>)]) {
    let window_end = window_off + buf.len() as u64;
    for (roff, bytes) in ranges {
        let rend = roff + bytes.len() as u64;
        if rend <= window_off || *roff >= window_end {
            continue;
        }
        let copy_start = window_off.max(*roff);
        let copy_end = window_end.min(rend);
        let dst = (copy_start - window_off) as usize;
        let src = (copy_start - roff) as usize;
        let n = (copy_end - copy_start) as usize;
        buf[dst..dst + n].copy_from_slice(&bytes[src..src + n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_clips_to_window() {
        let ranges = vec![(2u64, b"XYZ".to_vec()), (10, b"AB".to_vec())];
        let mut buf = vec![b'.'; 6];
        overlay(&mut buf, 3, &ranges);
        // range at 2 contributes "YZ" at window start; range at 10 is outside
        assert_eq!(&buf, b"YZ....");
    }

    #[test]
    fn overlay_handles_interior_ranges() {
        let ranges = vec![(4u64, b"mid".to_vec())];
        let mut buf = vec![b'-'; 10];
        overlay(&mut buf, 0, &ranges);
        assert_eq!(&buf, b"----mid---");
    }
}
