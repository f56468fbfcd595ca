//! Hardware Execution Thread (C4).
//!
//! The backend is modeled as non-thread-safe, so it is owned by one
//! dedicated OS thread rather than driven from the async runtime. External
//! callers talk to it through `HardwareThread::submit`, which enqueues an
//! operation and awaits a reply with a bounded timeout. Operations that
//! need to issue further backend calls from inside their own execution
//! (the decouple/download/couple sequence below) get a `HwCtx` handle with
//! direct `&mut dyn HardwareBackend` access instead of recursing through
//! the channel — recursing would deadlock a single-worker queue. This
//! sidesteps the need for a runtime thread-identity check entirely: nested
//! steps simply never go through `submit`.

pub mod backend;

use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{HvError, HvResult};
pub use backend::{BackendRef, BufferDescriptor, DmaDirection, HardwareBackend, MmioDescriptor};

/// Handle given to a job running on the hardware thread, for issuing
/// further backend calls without going back through the queue.
pub struct HwCtx<'a> {
    backend: &'a mut dyn HardwareBackend,
}

impl<'a> HwCtx<'a> {
    pub fn decouple(&mut self, zone_id: u32) -> anyhow::Result<()> {
        self.backend.decouple(zone_id)
    }
    pub fn couple(&mut self, zone_id: u32) -> anyhow::Result<()> {
        self.backend.couple(zone_id)
    }
    pub fn download_bitstream(&mut self, zone_id: u32, path: &std::path::Path) -> anyhow::Result<()> {
        self.backend.download_bitstream(zone_id, path)
    }
}

/// The decouple/download/couple sequence, factored out of the job closure
/// so it can be driven directly against a `HwCtx` in tests without spinning
/// up a whole hardware thread. Any failure re-couples the zone before the
/// error propagates.
fn reconfigure_sequence(ctx: &mut HwCtx<'_>, zone_id: u32, bitstream_path: &std::path::Path) -> anyhow::Result<()> {
    let result = (|| -> anyhow::Result<()> {
        ctx.decouple(zone_id)?;
        std::thread::sleep(Duration::from_millis(100));
        ctx.download_bitstream(zone_id, bitstream_path)?;
        std::thread::sleep(Duration::from_millis(200));
        ctx.couple(zone_id)?;
        Ok(())
    })();

    if result.is_err() {
        // Best-effort: a failed re-couple is logged by the caller's error
        // path, not escalated over this one.
        let _ = ctx.couple(zone_id);
    }
    result
}

type Job = Box<dyn FnOnce(&mut dyn HardwareBackend) -> anyhow::Result<JobResult> + Send>;

enum JobResult {
    Unit,
    U32(u32),
    BackendRef(BackendRef),
    BackendRefWithBuffer(BackendRef, BufferDescriptor),
    Bytes(Vec<u8>),
}

struct QueuedJob {
    job: Job,
    reply: oneshot::Sender<anyhow::Result<JobResult>>,
}

/// Owns the backend on a dedicated OS thread and accepts work over an mpsc
/// queue. Construct with `spawn`, which blocks the caller until `init`
/// has completed on the worker thread (the readiness gate).
pub struct HardwareThread {
    tx: std_mpsc::Sender<QueuedJob>,
    timeout: Duration,
}

impl HardwareThread {
    pub fn spawn(
        mut backend: Box<dyn HardwareBackend>,
        static_bitstream: PathBuf,
        num_zones: u32,
        timeout_secs: u64,
    ) -> anyhow::Result<Self> {
        let (tx, rx) = std_mpsc::channel::<QueuedJob>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<anyhow::Result<()>>();

        std::thread::Builder::new()
            .name("hv-hardware".to_string())
            .spawn(move || {
                let init_result = backend.init(&static_bitstream, num_zones);
                let ok = init_result.is_ok();
                let _ = ready_tx.send(init_result);
                if !ok {
                    return;
                }
                for queued in rx {
                    let result = (queued.job)(backend.as_mut());
                    let _ = queued.reply.send(result);
                }
            })
            .map_err(|e| anyhow::anyhow!("spawning hardware thread: {e}"))?;

        ready_rx
            .recv()
            .map_err(|_| anyhow::anyhow!("hardware thread died before becoming ready"))??;

        Ok(Self {
            tx,
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    async fn submit<F>(&self, job: F) -> HvResult<JobResult>
    where
        F: FnOnce(&mut dyn HardwareBackend) -> anyhow::Result<JobResult> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(QueuedJob {
                job: Box::new(job),
                reply: reply_tx,
            })
            .map_err(|_| HvError::Internal(anyhow::anyhow!("hardware thread is gone")))?;

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(e))) => Err(HvError::ReconfigError(e.to_string())),
            Ok(Err(_)) => Err(HvError::Internal(anyhow::anyhow!("hardware thread dropped the reply channel"))),
            Err(_) => Err(HvError::Timeout),
        }
    }

    /// Decouple -> settle -> download -> settle -> couple, per zone. Any
    /// failure attempts a best-effort re-couple before returning the error,
    /// so a failed reconfiguration never leaves a zone electrically
    /// isolated.
    pub async fn reconfigure_pr_zone(&self, zone_id: u32, bitstream_path: PathBuf) -> HvResult<()> {
        self.submit(move |backend| {
            let mut ctx = HwCtx { backend };
            reconfigure_sequence(&mut ctx, zone_id, &bitstream_path).map(|_| JobResult::Unit)
        })
        .await
        .map(|_| ())
    }

    pub async fn create_mmio(&self, base_address: u64, length: u64) -> HvResult<BackendRef> {
        match self.submit(move |b| b.create_mmio(base_address, length).map(JobResult::BackendRef)).await? {
            JobResult::BackendRef(r) => Ok(r),
            _ => unreachable!(),
        }
    }

    pub async fn mmio_read(&self, handle: BackendRef, offset: u64) -> HvResult<u32> {
        match self.submit(move |b| b.mmio_read(handle, offset).map(JobResult::U32)).await? {
            JobResult::U32(v) => Ok(v),
            _ => unreachable!(),
        }
    }

    pub async fn mmio_write(&self, handle: BackendRef, offset: u64, value: u32) -> HvResult<()> {
        self.submit(move |b| b.mmio_write(handle, offset, value).map(|_| JobResult::Unit))
            .await
            .map(|_| ())
    }

    pub async fn destroy_mmio(&self, handle: BackendRef) -> HvResult<()> {
        self.submit(move |b| b.destroy_mmio(handle).map(|_| JobResult::Unit))
            .await
            .map(|_| ())
    }

    pub async fn allocate_buffer(&self, size: u64) -> HvResult<(BackendRef, BufferDescriptor)> {
        match self
            .submit(move |b| b.allocate_buffer(size).map(|(r, d)| JobResult::BackendRefWithBuffer(r, d)))
            .await?
        {
            JobResult::BackendRefWithBuffer(r, d) => Ok((r, d)),
            _ => unreachable!(),
        }
    }

    pub async fn read_buffer(&self, handle: BackendRef, offset: u64, len: u64) -> HvResult<Vec<u8>> {
        match self.submit(move |b| b.read_buffer(handle, offset, len).map(JobResult::Bytes)).await? {
            JobResult::Bytes(v) => Ok(v),
            _ => unreachable!(),
        }
    }

    pub async fn write_buffer(&self, handle: BackendRef, offset: u64, data: Vec<u8>) -> HvResult<()> {
        self.submit(move |b| b.write_buffer(handle, offset, &data).map(|_| JobResult::Unit))
            .await
            .map(|_| ())
    }

    pub async fn free_buffer(&self, handle: BackendRef) -> HvResult<()> {
        self.submit(move |b| b.free_buffer(handle).map(|_| JobResult::Unit))
            .await
            .map(|_| ())
    }

    pub async fn create_dma(&self, zone_id: u32) -> HvResult<BackendRef> {
        match self.submit(move |b| b.create_dma(zone_id).map(JobResult::BackendRef)).await? {
            JobResult::BackendRef(r) => Ok(r),
            _ => unreachable!(),
        }
    }

    pub async fn dma_transfer(
        &self,
        handle: BackendRef,
        buffer: BackendRef,
        direction: DmaDirection,
        length: u64,
    ) -> HvResult<()> {
        self.submit(move |b| b.dma_transfer(handle, buffer, direction, length).map(|_| JobResult::Unit))
            .await
            .map(|_| ())
    }

    pub async fn destroy_dma(&self, handle: BackendRef) -> HvResult<()> {
        self.submit(move |b| b.destroy_dma(handle).map(|_| JobResult::Unit))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::backend::MockHardwareBackend;
    use super::*;

    fn spawn_mock() -> HardwareThread {
        HardwareThread::spawn(Box::new(MockHardwareBackend::default()), PathBuf::from("/nonexistent"), 2, 5).unwrap()
    }

    #[tokio::test]
    async fn reconfigure_then_mmio_round_trips() {
        let hw = spawn_mock();
        hw.reconfigure_pr_zone(0, PathBuf::from("conv2d.bit")).await.unwrap();

        let handle = hw.create_mmio(0xA000_0000, 0x1000).await.unwrap();
        hw.mmio_write(handle, 0x10, 0xdead_beef).await.unwrap();
        let value = hw.mmio_read(handle, 0x10).await.unwrap();
        assert_eq!(value, 0xdead_beef);
    }

    #[tokio::test]
    async fn buffer_lifecycle() {
        let hw = spawn_mock();
        let (handle, descriptor) = hw.allocate_buffer(64).await.unwrap();
        assert_eq!(descriptor.size, 64);
        hw.write_buffer(handle, 0, vec![1, 2, 3, 4]).await.unwrap();
        let data = hw.read_buffer(handle, 0, 4).await.unwrap();
        assert_eq!(data, vec![1, 2, 3, 4]);
        hw.free_buffer(handle).await.unwrap();
    }

    #[tokio::test]
    async fn mmio_out_of_range_is_reconfig_error() {
        let hw = spawn_mock();
        let handle = hw.create_mmio(0xA000_0000, 0x10).await.unwrap();
        let err = hw.mmio_read(handle, 0x100).await.unwrap_err();
        assert!(matches!(err, HvError::ReconfigError(_)));
    }

    #[test]
    fn failed_download_still_recouples_the_zone() {
        let mut backend = MockHardwareBackend::default();
        backend.init(std::path::Path::new("/nonexistent"), 2).unwrap();
        backend.decouple(0).unwrap();
        assert!(backend.is_decoupled(0));

        let mut ctx = HwCtx { backend: &mut backend };
        let err = reconfigure_sequence(&mut ctx, 0, std::path::Path::new("FAIL_INJECT.bit")).unwrap_err();
        assert!(err.to_string().contains("injected"));
        assert!(!backend.is_decoupled(0), "zone must be re-coupled after a failed reconfigure");
    }
}
