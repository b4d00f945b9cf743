//! Background strile compression
//!
//! Workers only compress; they never touch the dataset. Finished payloads are
//! written by the dataset, in submission order, when a block is needed or
//! the queue is drained.

use super::arena::LayerId;
use crate::compression::{CodecParams, Compressor};
use crate::error::{RasterError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Default)]
pub(crate) struct Job {
    result: Mutex<Option<Result<Vec<u8>>>>,
    done: Condvar,
}

impl Job {
    fn finish(&self, result: Result<Vec<u8>>) {
        *self.result.lock() = Some(result);
        self.done.notify_all();
    }

    /// Block until the worker has stored its result
    pub fn wait(&self) -> Result<Vec<u8>> {
        let mut guard = self.result.lock();
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            self.done.wait(&mut guard);
        }
    }
}

pub(crate) struct PendingWrite {
    pub layer: LayerId,
    pub strile: usize,
    pub job: Arc<Job>,
}

pub struct CompressionQueue {
    pool: rayon::ThreadPool,
    pending: VecDeque<PendingWrite>,
}

impl CompressionQueue {
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("gtiff-compress-{}", index))
            .build()
            .map_err(|e| RasterError::Configuration(format!("compression pool: {}", e)))?;
        Ok(Self {
            pool,
            pending: VecDeque::new(),
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Queue `raw` for compression as strile `strile` of `layer`
    pub fn submit(
        &mut self,
        layer: LayerId,
        strile: usize,
        codec: Arc<dyn Compressor>,
        raw: Vec<u8>,
        params: CodecParams,
    ) {
        let job = Arc::new(Job::default());
        let worker = Arc::clone(&job);
        self.pool.spawn(move || worker.finish(codec.compress(&raw, &params)));
        self.pending.push_back(PendingWrite { layer, strile, job });
    }

    pub fn is_pending(&self, layer: LayerId, strile: usize) -> bool {
        self.pending
            .iter()
            .any(|p| p.layer == layer && p.strile == strile)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Jobs up to and including the last one for `strile`, oldest first
    pub(crate) fn take_through(&mut self, layer: LayerId, strile: usize) -> Vec<PendingWrite> {
        match self
            .pending
            .iter()
            .rposition(|p| p.layer == layer && p.strile == strile)
        {
            Some(last) => self.pending.drain(..=last).collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn take_all(&mut self) -> Vec<PendingWrite> {
        self.pending.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{get_compressor, CompressionMethod};
    use crate::types::DataType;

    #[test]
    fn test_results_come_back_in_order() {
        let mut queue = CompressionQueue::new(2).unwrap();
        let codec = get_compressor(CompressionMethod::Deflate).unwrap();
        let params = CodecParams::new(16, 16, DataType::U8);
        for strile in 0..4 {
            queue.submit(
                LayerId::MAIN,
                strile,
                Arc::clone(&codec),
                vec![strile as u8; 256],
                params,
            );
        }
        assert!(queue.is_pending(LayerId::MAIN, 2));

        let first = queue.take_through(LayerId::MAIN, 1);
        assert_eq!(
            first.iter().map(|p| p.strile).collect::<Vec<_>>(),
            vec![0, 1]
        );
        for pending in first {
            let encoded = pending.job.wait().unwrap();
            let decoded = codec.decompress(&encoded, &params).unwrap();
            assert_eq!(decoded, vec![pending.strile as u8; 256]);
        }
        assert_eq!(queue.len(), 2);
        assert!(queue.take_through(LayerId(3), 0).is_empty());
        assert_eq!(queue.take_all().len(), 2);
        assert!(queue.is_empty());
    }
}
