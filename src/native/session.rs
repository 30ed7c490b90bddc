use anyhow::{anyhow, Context, Result};
use url::Url;

use crate::client::{ClientConfig, SessionClient};
use crate::frame::{Detection, Frame};

use super::{PublisherConfig, StreamPublisher};

/// Publishes over the session wire format to `tcp://host:port`, without
/// waiting for replies.
pub struct SessionPublisher {
    config: PublisherConfig,
    host: String,
    port: u16,
    client: SessionClient,
    started: bool,
}

impl SessionPublisher {
    pub fn new(config: PublisherConfig) -> Result<Self> {
        let url = Url::parse(&config.url).context("parse publisher url")?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("{} has no host", config.url))?
            .to_string();
        let port = url
            .port()
            .ok_or_else(|| anyhow!("{} has no port", config.url))?;
        let client = SessionClient::new(ClientConfig {
            expect_reply: false,
            ..ClientConfig::default()
        });
        Ok(Self {
            config,
            host,
            port,
            client,
            started: false,
        })
    }
}

impl StreamPublisher for SessionPublisher {
    fn initialize(&mut self) -> Result<()> {
        self.config.validate()?;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.client.connect(&self.host, self.port as i64)?;
        self.started = true;
        log::info!("SessionPublisher: publishing to {}", self.config.url);
        Ok(())
    }

    fn push_frame(&mut self, frame: &Frame, regions: &[Detection]) -> Result<()> {
        if !self.started {
            return Err(anyhow!("publisher not started"));
        }
        self.client.send_frame(frame, regions)
    }

    fn stop(&mut self) -> Result<()> {
        self.client.disconnect();
        self.started = false;
        Ok(())
    }
}
