//! Detector driven over a raw vendor TCP socket.
//!
//! Some detectors ship with a vendor control server instead of an IOC: the
//! host configures and starts them through a line-oriented ASCII command
//! protocol, and exposure completion is reported out-of-band on a digital
//! I/O line. This driver speaks the command protocol and watches the DIO
//! done bit as a [`Signal`].
//!
//! Protocol: one command per line, LF-terminated. The box replies `OK`,
//! `OK <payload>`, or `ERR <reason>` on a single line.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::acquire::documents::{AssetCache, ResourceDoc};
use crate::device::{
    series_file_name, AreaDetector, Device, DeviceFamily, StagingSetup, TriggerHandle,
};
use crate::error::{AcquireError, AppResult};
use crate::retry::RetryPolicy;
use crate::signal::Signal;

#[derive(Debug, Default)]
struct VendorState {
    setup: Option<StagingSetup>,
    staged: bool,
    next_frame: u32,
    pending_file: Option<String>,
    last_written: Option<String>,
}

/// Area detector controlled through a vendor TCP command server
#[derive(Debug)]
pub struct VendorSocketDetector {
    name: String,
    /// Command link protected by Mutex for exclusive access
    link: Mutex<BufReader<TcpStream>>,
    /// Command timeout duration
    timeout: Duration,
    /// Exposure-done bit on the DIO line
    dio_done: Signal<bool>,
    frames_per_point: u32,
    needs_pulses: bool,
    state: Arc<RwLock<VendorState>>,
    assets: AssetCache,
}

impl VendorSocketDetector {
    /// Connect to the vendor control server, retrying per `retry`.
    ///
    /// # Arguments
    /// * `addr` - server address, e.g. `"10.54.116.90:52000"`
    ///
    /// # Errors
    /// Returns a device error once every attempt is exhausted.
    pub async fn connect(
        name: impl Into<String>,
        addr: &str,
        retry: RetryPolicy,
    ) -> AppResult<Self> {
        let name = name.into();
        let mut last_err = String::new();
        for attempt in 1..=retry.max_attempts {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    info!(device = %name, addr, attempt, "connected to vendor server");
                    return Ok(Self {
                        link: Mutex::new(BufReader::new(stream)),
                        timeout: Duration::from_secs(5),
                        dio_done: Signal::new(format!("{name}.dio_done"), false)
                            .with_description("exposure-done bit on the DIO line"),
                        name,
                        frames_per_point: 1,
                        needs_pulses: false,
                        state: Arc::new(RwLock::new(VendorState {
                            next_frame: 1,
                            ..VendorState::default()
                        })),
                        assets: AssetCache::new(),
                    });
                }
                Err(e) => {
                    warn!(device = %name, addr, attempt, error = %e, "vendor server connect failed");
                    last_err = e.to_string();
                    if retry.has_next(attempt) {
                        tokio::time::sleep(retry.backoff).await;
                    }
                }
            }
        }
        Err(AcquireError::Device(format!(
            "'{name}' unreachable at {addr} after {} attempts: {last_err}",
            retry.max_attempts
        )))
    }

    pub fn with_frames_per_point(mut self, frames_per_point: u32) -> Self {
        self.frames_per_point = frames_per_point.max(1);
        self
    }

    /// Mark this detector as depending on an external pulse generator
    pub fn with_external_pulses(mut self) -> Self {
        self.needs_pulses = true;
        self
    }

    /// DIO done bit, shared with the hardware shim and monitors
    pub fn dio_signal(&self) -> Signal<bool> {
        self.dio_done.clone()
    }

    /// Send a command and parse the single-line reply.
    ///
    /// # Returns
    /// The payload after `OK`, empty for a bare `OK`.
    async fn command(&self, command: &str) -> AppResult<String> {
        let mut link = self.link.lock().await;

        let cmd = format!("{command}\n");
        link.get_mut().write_all(cmd.as_bytes()).await?;

        let mut reply = String::new();
        let n = tokio::time::timeout(self.timeout, link.read_line(&mut reply))
            .await
            .map_err(|_| {
                AcquireError::Device(format!(
                    "'{}' timed out waiting for reply to '{command}'",
                    self.name
                ))
            })??;
        if n == 0 {
            return Err(AcquireError::Device(format!(
                "'{}' connection closed by vendor server",
                self.name
            )));
        }

        let reply = reply.trim_end();
        debug!(device = %self.name, command, reply, "vendor exchange");
        if let Some(reason) = reply.strip_prefix("ERR") {
            return Err(AcquireError::Device(format!(
                "'{}' rejected '{command}': {}",
                self.name,
                reason.trim()
            )));
        }
        match reply.strip_prefix("OK") {
            Some(payload) => Ok(payload.trim().to_string()),
            None => Err(AcquireError::Device(format!(
                "'{}' sent unexpected reply '{reply}' to '{command}'",
                self.name
            ))),
        }
    }
}

#[async_trait]
impl Device for VendorSocketDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> DeviceFamily {
        DeviceFamily::VendorSocket
    }

    async fn stage(&self) -> AppResult<()> {
        let (setup, begin) = {
            let state = self.state.read();
            if state.staged {
                return Err(AcquireError::AlreadyStaged(self.name.clone()));
            }
            let setup = state.setup.clone().ok_or_else(|| {
                AcquireError::Device(format!("'{}' staged without a staging setup", self.name))
            })?;
            (setup, state.next_frame)
        };

        let end = begin + setup.num_images - 1;
        let file = series_file_name(&setup.file_name, begin, end);
        self.assets.stage_resource(
            ResourceDoc::new(&self.name, &setup.file_path, &file)
                .with_frames_per_point(self.frames_per_point),
        );
        self.dio_done.set_unchecked(false);

        // Arming is the last command of the staging sequence
        self.command("CAPTURE:ARM").await?;

        let mut state = self.state.write();
        state.pending_file = Some(file.clone());
        state.next_frame = end + 1;
        state.staged = true;
        info!(
            device = %self.name,
            family = self.family().label(),
            file = %file,
            frames = setup.num_images,
            "staged"
        );
        Ok(())
    }

    async fn unstage(&self) -> AppResult<()> {
        {
            let mut state = self.state.write();
            state.staged = false;
            state.pending_file = None;
        }
        self.command("CAPTURE:DISARM").await?;
        info!(device = %self.name, "unstaged");
        Ok(())
    }

    async fn is_staged(&self) -> AppResult<bool> {
        Ok(self.state.read().staged)
    }

    async fn trigger(&self) -> AppResult<Option<TriggerHandle>> {
        let frames = {
            let state = self.state.read();
            if !state.staged {
                return Err(AcquireError::Device(format!(
                    "'{}' triggered while unstaged",
                    self.name
                )));
            }
            state.setup.as_ref().map(|s| s.num_images).unwrap_or(0)
        };

        self.command("ACQUIRE:START").await?;

        let (handle, tx) = TriggerHandle::channel(self.name.clone());
        let mut rx = self.dio_done.subscribe();
        let state = Arc::clone(&self.state);
        let assets = self.assets.clone();
        let points = frames.div_ceil(self.frames_per_point);
        let name = self.name.clone();
        tokio::spawn(async move {
            loop {
                if *rx.borrow_and_update() {
                    break;
                }
                if rx.changed().await.is_err() {
                    let _ = tx.send(Err("DIO done signal closed".to_string()));
                    return;
                }
            }
            {
                let mut state = state.write();
                state.last_written = state.pending_file.take();
            }
            assets.record_datums(points);
            debug!(device = %name, frames, "DIO reported exposure done");
            let _ = tx.send(Ok(()));
        });
        Ok(Some(handle))
    }
}

#[async_trait]
impl AreaDetector for VendorSocketDetector {
    async fn staging_setup(&self, setup: &StagingSetup) -> AppResult<()> {
        setup.validate()?;
        self.command(&format!("SET:PATH {}", setup.file_path.display()))
            .await?;
        self.command(&format!("SET:NAME {}", setup.file_name)).await?;
        self.command(&format!("SET:FRAMES {}", setup.num_images))
            .await?;
        self.command(&format!("SET:TIME {}", setup.acquire_time))
            .await?;
        self.command(&format!("SET:PERIOD {}", setup.acquire_period))
            .await?;
        self.state.write().setup = Some(setup.clone());
        Ok(())
    }

    async fn images_received(&self) -> AppResult<u32> {
        let payload = self.command("STATUS:FRAMES").await?;
        payload.parse::<u32>().map_err(|_| {
            AcquireError::Device(format!(
                "'{}' sent unparseable frame count '{payload}'",
                self.name
            ))
        })
    }

    fn frames_per_point(&self) -> u32 {
        self.frames_per_point
    }

    fn needs_external_pulses(&self) -> bool {
        self.needs_pulses
    }

    async fn written_file_name(&self) -> AppResult<String> {
        self.state.read().last_written.clone().ok_or_else(|| {
            AcquireError::Device(format!(
                "'{}' has no completed exposure series to report",
                self.name
            ))
        })
    }

    fn assets(&self) -> &AssetCache {
        &self.assets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    // Single-connection vendor server stub. Answers OK to everything except
    // commands listed in `reject`, and reports `frames` for STATUS:FRAMES.
    async fn vendor_stub(frames: u32, reject: &'static str) -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut link = BufReader::new(stream);
            let mut line = String::new();
            loop {
                line.clear();
                if link.read_line(&mut line).await.unwrap_or(0) == 0 {
                    break;
                }
                let cmd = line.trim_end();
                let reply = if !reject.is_empty() && cmd.starts_with(reject) {
                    "ERR busy\n".to_string()
                } else if cmd == "STATUS:FRAMES" {
                    format!("OK {frames}\n")
                } else {
                    "OK\n".to_string()
                };
                link.get_mut().write_all(reply.as_bytes()).await.unwrap();
            }
        });
        (addr, handle)
    }

    fn setup(num_images: u32) -> StagingSetup {
        StagingSetup {
            file_path: PathBuf::from("/data/xpcs"),
            file_name: "B012_sample".to_string(),
            num_images,
            acquire_time: 0.001,
            acquire_period: 0.002,
        }
    }

    #[tokio::test]
    async fn lifecycle_over_the_socket() {
        let (addr, _server) = vendor_stub(7, "").await;
        let det = VendorSocketDetector::connect("rigaku", &addr, RetryPolicy::once())
            .await
            .unwrap();

        det.staging_setup(&setup(7)).await.unwrap();
        det.stage().await.unwrap();
        let resource = det.assets().resource().unwrap();
        assert_eq!(resource.resource_path, "B012_sample_00001-00007.imm");

        let handle = det.trigger().await.unwrap().unwrap();
        det.dio_signal().set_unchecked(true);
        handle.wait().await.unwrap();

        assert_eq!(det.images_received().await.unwrap(), 7);
        assert_eq!(det.assets().datum_count(), 7);
        assert_eq!(
            det.written_file_name().await.unwrap(),
            "B012_sample_00001-00007.imm"
        );
        det.unstage().await.unwrap();
        assert!(!det.is_staged().await.unwrap());
    }

    #[tokio::test]
    async fn rejected_start_surfaces_the_reason() {
        let (addr, _server) = vendor_stub(0, "ACQUIRE:START").await;
        let det = VendorSocketDetector::connect("rigaku", &addr, RetryPolicy::once())
            .await
            .unwrap();
        det.staging_setup(&setup(3)).await.unwrap();
        det.stage().await.unwrap();

        let err = det.trigger().await.unwrap_err();
        assert!(err.to_string().contains("busy"));
    }

    #[tokio::test]
    async fn connect_retries_are_bounded() {
        // Grab a port with no listener behind it
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let err = VendorSocketDetector::connect(
            "rigaku",
            &addr,
            RetryPolicy::new(2, Duration::from_millis(1)),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("after 2 attempts"));
    }
}
