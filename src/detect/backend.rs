use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;
use crate::settings::DetectionKind;

/// Detector backend trait.
///
/// A backend finds regions of one [`DetectionKind`] in a frame. It only reports
/// where sensitive content is; redaction is applied by the processor.
///
/// Implementations MUST NOT:
/// - Keep references to frame pixels beyond the `detect` call
/// - Write frames to disk or send them over the network
/// - Report the recognized text of plates or numbers
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Kind of content this backend locates.
    fn kind(&self) -> DetectionKind;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
