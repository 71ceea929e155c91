use crate::error::BackendError;
use crate::selector::TextRecognizer;
use crate::types::Hypothesis;
use image::{GrayImage, ImageFormat};
use log::{error, trace};
use std::io::Cursor;
use std::time::Duration;
use tokio::runtime::Handle;
use url::Url;

/// Posts each crop as a PNG to an OCR service answering `[{"text", "confidence"}]`.
///
/// `recognize` blocks on the runtime handle, so it must run on a blocking thread.
pub struct HttpRecognizer {
    client: reqwest::Client,
    url: Url,
    runtime: Handle,
}

impl HttpRecognizer {
    pub fn new(url: Url, timeout: Duration, runtime: Handle) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpRecognizer {
            client,
            url,
            runtime,
        })
    }

    async fn post(&self, png: Vec<u8>) -> Result<Vec<Hypothesis>, BackendError> {
        let response = self
            .client
            .post(self.url.clone())
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .body(png)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::Status(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }
}

impl TextRecognizer for HttpRecognizer {
    fn recognize(&self, crop: &GrayImage) -> Vec<Hypothesis> {
        let mut png = Vec::new();
        if let Err(e) = crop.write_to(&mut Cursor::new(&mut png), ImageFormat::Png) {
            error!("Unable to encode crop: {:?}", e);
            return vec![];
        }
        match self.runtime.block_on(self.post(png)) {
            Ok(hypotheses) => {
                trace!("OCR returned {:?}", hypotheses);
                hypotheses
            }
            Err(e) => {
                error!("OCR request failed: {}", e);
                vec![]
            }
        }
    }
}
