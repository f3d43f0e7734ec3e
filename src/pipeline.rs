//! Multi-slot orchestrator
//!
//! The slot map lock covers insertion, removal and lookup only. Blocking
//! lifecycle work (start, stop, restart, wake, metadata pushes) runs on a
//! small worker pool so callers return immediately.
//!
//! A stop waits for the relay watchdog to exit. A watchdog caught inside a
//! connect attempt holds that up to `CONNECT_TIMEOUT + HANDSHAKE_TIMEOUT`, so
//! with fewer workers than slots, queued operations can sit behind several
//! such stops. Size `worker_threads` to the number of stations that may be
//! stopped or restarted together.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};

use crate::config::{AppConfig, EncoderConfig};
use crate::dsp::DspChainConfig;
use crate::error::{Result, SlotError};
use crate::slot::{EncoderSlot, SlotServices, Stats};

type Job = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }
}

/// Fixed set of threads draining a job channel
struct WorkerPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    pending: Arc<Pending>,
}

impl WorkerPool {
    fn new(size: usize) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let pending = Arc::new(Pending::default());
        let workers = (0..size.max(1))
            .filter_map(|i| {
                let rx = rx.clone();
                let pending = pending.clone();
                thread::Builder::new()
                    .name(format!("pipeline-worker{}", i))
                    .spawn(move || {
                        for job in rx.iter() {
                            job();
                            pending.done();
                        }
                    })
                    .map_err(|e| tracing::error!("Failed to spawn pipeline worker: {}", e))
                    .ok()
            })
            .collect();
        Self {
            tx: Some(tx),
            workers,
            pending,
        }
    }

    fn execute(&self, job: Job) -> bool {
        let Some(tx) = self.tx.as_ref() else {
            return false;
        };
        self.pending.add();
        if tx.send(job).is_err() {
            self.pending.done();
            return false;
        }
        true
    }

    /// Block until every queued job has run
    fn wait_idle(&self) {
        self.pending.wait();
    }

    fn shutdown(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("Pipeline worker panicked");
            }
        }
    }
}

/// Keyed collection of encoder slots
pub struct AudioPipeline {
    slots: Mutex<BTreeMap<u32, Arc<EncoderSlot>>>,
    services: SlotServices,
    master_volume: Mutex<f32>,
    pool: WorkerPool,
}

impl AudioPipeline {
    pub fn new(worker_threads: usize) -> Self {
        Self::with_services(worker_threads, SlotServices::default())
    }

    pub fn with_services(worker_threads: usize, services: SlotServices) -> Self {
        tracing::debug!("Pipeline starting {} workers", worker_threads.max(1));
        Self {
            slots: Mutex::new(BTreeMap::new()),
            services,
            master_volume: Mutex::new(1.0),
            pool: WorkerPool::new(worker_threads),
        }
    }

    /// Pipeline with every configured slot added (not started)
    pub fn from_config(config: &AppConfig, services: SlotServices) -> Result<Self> {
        config.validate()?;
        let pipeline = Self::with_services(config.worker_threads, services);
        for slot in &config.slots {
            pipeline.add_slot(slot.clone())?;
        }
        pipeline.set_master_volume(config.master_volume);
        Ok(pipeline)
    }

    fn slot(&self, slot_id: u32) -> Option<Arc<EncoderSlot>> {
        self.slots.lock().get(&slot_id).cloned()
    }

    pub fn slot_ids(&self) -> Vec<u32> {
        self.slots.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn add_slot(&self, config: EncoderConfig) -> Result<()> {
        config.validate()?;
        let id = config.slot_id;
        let mut slots = self.slots.lock();
        if slots.contains_key(&id) {
            return Err(SlotError::AlreadyExists(id).into());
        }
        slots.insert(
            id,
            Arc::new(EncoderSlot::with_services(config, self.services.clone())),
        );
        tracing::info!("Added slot {}", id);
        Ok(())
    }

    /// Remove a slot, stopping it first
    pub fn remove_slot(&self, slot_id: u32) -> Result<()> {
        let slot = self
            .slots
            .lock()
            .remove(&slot_id)
            .ok_or(SlotError::NotFound(slot_id))?;
        slot.stop()?;
        tracing::info!("Removed slot {}", slot_id);
        Ok(())
    }

    fn dispatch(&self, slot_id: u32, action: &'static str, op: fn(&EncoderSlot) -> Result<()>) -> bool {
        let Some(slot) = self.slot(slot_id) else {
            tracing::warn!("Cannot {} slot {}: not found", action, slot_id);
            return false;
        };
        self.pool.execute(Box::new(move || {
            if let Err(e) = op(&slot) {
                tracing::warn!("Slot {} {} failed: {}", slot_id, action, e);
            }
        }))
    }

    /// Start in the background. False when the slot does not exist.
    pub fn start_slot(&self, slot_id: u32) -> bool {
        self.dispatch(slot_id, "start", EncoderSlot::start)
    }

    /// Stop in the background. May occupy a worker while an unreachable
    /// relay finishes its connect attempt.
    pub fn stop_slot(&self, slot_id: u32) -> bool {
        self.dispatch(slot_id, "stop", EncoderSlot::stop)
    }

    pub fn restart_slot(&self, slot_id: u32) -> bool {
        self.dispatch(slot_id, "restart", |slot| {
            slot.stop()?;
            slot.start()
        })
    }

    pub fn wake_slot(&self, slot_id: u32) -> bool {
        self.dispatch(slot_id, "wake", EncoderSlot::wake)
    }

    pub fn load_playlist(&self, slot_id: u32, path: &Path) -> Result<usize> {
        let slot = self.slot(slot_id).ok_or(SlotError::NotFound(slot_id))?;
        slot.load_playlist(path)
    }

    pub fn skip_track(&self, slot_id: u32) -> bool {
        self.slot(slot_id).map_or(false, |slot| slot.skip_track())
    }

    pub fn set_volume(&self, slot_id: u32, volume: f32) -> bool {
        match self.slot(slot_id) {
            Some(slot) => {
                slot.set_volume(volume);
                true
            }
            None => false,
        }
    }

    /// Push now-playing text in the background
    pub fn push_metadata(&self, slot_id: u32, title: &str, artist: &str) -> bool {
        let Some(slot) = self.slot(slot_id) else {
            return false;
        };
        let (title, artist) = (title.to_string(), artist.to_string());
        self.pool.execute(Box::new(move || {
            if !slot.push_metadata(&title, &artist) {
                tracing::debug!("Slot {} metadata not acknowledged", slot_id);
            }
        }))
    }

    pub fn reconfigure_dsp(&self, slot_id: u32, config: DspChainConfig) -> bool {
        match self.slot(slot_id) {
            Some(slot) => {
                slot.reconfigure_dsp(config);
                true
            }
            None => false,
        }
    }

    pub fn slot_stats(&self, slot_id: u32) -> Option<Stats> {
        self.slot(slot_id).map(|slot| slot.stats())
    }

    /// Stats of every slot ordered by id
    pub fn all_stats(&self) -> Vec<Stats> {
        let slots: Vec<_> = self.slots.lock().values().cloned().collect();
        slots.iter().map(|slot| slot.stats()).collect()
    }

    /// Clamp to `[0, 2]` and apply to every slot
    pub fn set_master_volume(&self, volume: f32) -> f32 {
        let volume = if volume.is_finite() { volume.clamp(0.0, 2.0) } else { 1.0 };
        *self.master_volume.lock() = volume;
        let slots: Vec<_> = self.slots.lock().values().cloned().collect();
        for slot in slots {
            slot.set_volume(volume);
        }
        volume
    }

    pub fn master_volume(&self) -> f32 {
        *self.master_volume.lock()
    }

    /// Wait for queued lifecycle operations to finish
    pub fn wait_idle(&self) {
        self.pool.wait_idle();
    }

    /// Finish queued work, then stop every slot
    pub fn stop_all(&self) {
        self.pool.wait_idle();
        let slots: Vec<_> = self.slots.lock().values().cloned().collect();
        for slot in slots {
            if let Err(e) = slot.stop() {
                tracing::warn!("Slot {} stop failed: {}", slot.id(), e);
            }
        }
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.stop_all();
        self.pool.shutdown();
    }
}
