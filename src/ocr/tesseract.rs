use std::cell::RefCell;
use std::io::Cursor;

use anyhow::{anyhow, Context, Result};
use image::{GrayImage, ImageFormat};
use leptess::{capi, LepTess, Variable};

use super::{OcrEngine, OcrReading, OCR_ALLOWLIST};

/// Word-level recognition through Tesseract.
///
/// A `LepTess` handle is not `Send`, so the engine only carries its settings.
/// Each thread that calls [`OcrEngine::read`] builds its own handle on first
/// use and keeps it in thread-local storage.
pub struct TesseractEngine {
    data_path: Option<String>,
    language: String,
}

struct ThreadHandle {
    data_path: Option<String>,
    language: String,
    api: LepTess,
}

thread_local! {
    static HANDLE: RefCell<Option<ThreadHandle>> = const { RefCell::new(None) };
}

fn init_api(data_path: Option<&str>, language: &str) -> Result<LepTess> {
    let mut api = LepTess::new(data_path, language)
        .map_err(|e| anyhow!("tesseract init ({}): {}", language, e))?;
    api.set_variable(Variable::TesseditCharWhitelist, OCR_ALLOWLIST)
        .map_err(|e| anyhow!("tesseract whitelist: {}", e))?;
    Ok(api)
}

impl TesseractEngine {
    /// Fails early if the language data cannot be loaded.
    pub fn new(data_path: Option<&str>, language: &str) -> Result<Self> {
        let engine = Self {
            data_path: data_path.map(str::to_string),
            language: language.to_string(),
        };
        engine.with_api(|_| Ok(()))?;
        Ok(engine)
    }

    fn with_api<T>(&self, f: impl FnOnce(&mut LepTess) -> Result<T>) -> Result<T> {
        HANDLE.with(|cell| {
            let mut slot = cell.borrow_mut();
            let stale = slot
                .as_ref()
                .map_or(true, |h| h.data_path != self.data_path || h.language != self.language);
            if stale {
                *slot = Some(ThreadHandle {
                    data_path: self.data_path.clone(),
                    language: self.language.clone(),
                    api: init_api(self.data_path.as_deref(), &self.language)?,
                });
            }
            match slot.as_mut() {
                Some(handle) => f(&mut handle.api),
                None => Err(anyhow!("tesseract handle missing")),
            }
        })
    }
}

impl OcrEngine for TesseractEngine {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    fn read(&mut self, image: &GrayImage) -> Result<Vec<OcrReading>> {
        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .context("encode OCR input")?;

        self.with_api(|api| {
            api.set_image_from_mem(&png)
                .map_err(|e| anyhow!("tesseract set image: {}", e))?;

            let Some(boxes) = api.get_component_boxes(capi::TessPageIteratorLevel_RIL_WORD, true)
            else {
                return Ok(Vec::new());
            };

            let mut readings = Vec::new();
            for word in &boxes {
                api.set_rectangle(&word);
                let text = api
                    .get_utf8_text()
                    .map_err(|e| anyhow!("tesseract text: {}", e))?;
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                let geometry = word.get_geometry();
                let (x, y) = (geometry.x as f32, geometry.y as f32);
                let (w, h) = (geometry.w as f32, geometry.h as f32);
                readings.push(OcrReading {
                    quad: [(x, y), (x + w, y), (x + w, y + h), (x, y + h)],
                    text: text.to_string(),
                    confidence: api.mean_text_conf() as f32 / 100.0,
                });
            }
            Ok(readings)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}

    #[test]
    fn engine_moves_between_threads_without_its_handle() {
        assert_send::<TesseractEngine>();
    }
}
