//! Ordered staging directives for detector configuration.
//!
//! Staging a detector means pushing a handful of settings to hardware
//! sub-components (output path and name on the file writer, frame count and
//! timing on the camera) and then flipping the capture/start enable. The
//! enable must land after every other directive: a file writer that starts
//! capturing before its output path is set writes frames to the wrong file.
//!
//! [`StagingPlan`] makes that ordering structural rather than a convention:
//! however directives are pushed, iteration yields every configuration
//! directive first and capture/start directives last.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::device::StagingSetup;
use crate::error::AppResult;

/// One setting applied to a detector sub-component during staging
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Output directory on the file writer
    OutputPath(PathBuf),
    /// Base file name on the file writer
    OutputName(String),
    /// Number of frames in the series, on the camera
    FrameCount(u32),
    /// Per-frame exposure time in seconds, on the camera
    AcquireTime(f64),
    /// Frame-to-frame period in seconds, on the camera
    AcquirePeriod(f64),
    /// Capture/start enable on the file writer
    CaptureEnable,
}

impl Directive {
    /// Short label for log fields and staging traces
    pub fn label(&self) -> &'static str {
        match self {
            Directive::OutputPath(_) => "output_path",
            Directive::OutputName(_) => "output_name",
            Directive::FrameCount(_) => "frame_count",
            Directive::AcquireTime(_) => "acquire_time",
            Directive::AcquirePeriod(_) => "acquire_period",
            Directive::CaptureEnable => "capture_enable",
        }
    }

    /// Whether this directive starts capture rather than configuring it
    pub fn is_capture(&self) -> bool {
        matches!(self, Directive::CaptureEnable)
    }
}

/// Target a [`StagingPlan`] is applied to, one directive at a time
#[async_trait]
pub trait DirectiveSink: Send + Sync {
    /// Apply one directive to the underlying hardware
    async fn apply_directive(&self, directive: &Directive) -> AppResult<()>;
}

/// Ordered set of staging directives.
///
/// Push order is preserved within each group, but capture/start directives
/// always iterate after configuration directives regardless of push order.
#[derive(Debug, Clone, Default)]
pub struct StagingPlan {
    configure: Vec<Directive>,
    capture: Vec<Directive>,
}

impl StagingPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard plan for one exposure series: writer output, camera timing,
    /// then capture enable.
    pub fn for_setup(setup: &StagingSetup) -> Self {
        let mut plan = Self::new();
        plan.push(Directive::OutputPath(setup.file_path.clone()));
        plan.push(Directive::OutputName(setup.file_name.clone()));
        plan.push(Directive::FrameCount(setup.num_images));
        plan.push(Directive::AcquireTime(setup.acquire_time));
        plan.push(Directive::AcquirePeriod(setup.acquire_period));
        plan.push(Directive::CaptureEnable);
        plan
    }

    /// Add a directive, routing it to the group its kind belongs to
    pub fn push(&mut self, directive: Directive) {
        if directive.is_capture() {
            self.capture.push(directive);
        } else {
            self.configure.push(directive);
        }
    }

    /// Total number of directives in the plan
    pub fn len(&self) -> usize {
        self.configure.len() + self.capture.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configure.is_empty() && self.capture.is_empty()
    }

    /// Directives in application order: configuration first, capture last
    pub fn directives(&self) -> impl Iterator<Item = &Directive> {
        self.configure.iter().chain(self.capture.iter())
    }

    /// Apply every directive to `sink`, stopping at the first error
    pub async fn apply(&self, sink: &dyn DirectiveSink) -> AppResult<()> {
        for directive in self.directives() {
            sink.apply_directive(directive).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingSink {
        applied: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl DirectiveSink for RecordingSink {
        async fn apply_directive(&self, directive: &Directive) -> AppResult<()> {
            self.applied.lock().push(directive.label());
            Ok(())
        }
    }

    fn setup() -> StagingSetup {
        StagingSetup {
            file_path: PathBuf::from("/data"),
            file_name: "series".to_string(),
            num_images: 10,
            acquire_time: 0.001,
            acquire_period: 0.002,
        }
    }

    #[test]
    fn capture_iterates_last_even_when_pushed_first() {
        let mut plan = StagingPlan::new();
        plan.push(Directive::CaptureEnable);
        plan.push(Directive::OutputName("f".to_string()));
        plan.push(Directive::FrameCount(4));

        let labels: Vec<_> = plan.directives().map(Directive::label).collect();
        assert_eq!(labels, vec!["output_name", "frame_count", "capture_enable"]);
    }

    #[tokio::test]
    async fn standard_plan_applies_capture_after_configuration() {
        let sink = RecordingSink {
            applied: Mutex::new(Vec::new()),
        };
        StagingPlan::for_setup(&setup()).apply(&sink).await.unwrap();

        let applied = sink.applied.lock();
        assert_eq!(applied.len(), 6);
        assert_eq!(*applied.last().unwrap(), "capture_enable");
        assert!(applied[..5].iter().all(|label| *label != "capture_enable"));
    }

    #[tokio::test]
    async fn apply_stops_at_first_error() {
        struct FailingSink;

        #[async_trait]
        impl DirectiveSink for FailingSink {
            async fn apply_directive(&self, directive: &Directive) -> AppResult<()> {
                match directive {
                    Directive::FrameCount(_) => Err(crate::error::AcquireError::Device(
                        "frame count rejected".to_string(),
                    )),
                    _ => Ok(()),
                }
            }
        }

        let err = StagingPlan::for_setup(&setup())
            .apply(&FailingSink)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("frame count rejected"));
    }
}
