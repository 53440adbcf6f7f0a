use crate::error::*;
use crate::settings::HttpSettings;
use reqwest::tls;
use std::time::Duration;
use tracing::debug;
use tracing::instrument;
use tracing::warn;
use tracing::Level;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the HTTP clients used to talk to the CA.
#[derive(Debug, Clone)]
pub struct HttpClientFactory {
  settings: HttpSettings,
}

impl HttpClientFactory {
  pub fn new(settings: HttpSettings) -> Self {
    HttpClientFactory { settings }
  }

  fn min_tls(&self) -> Result<Option<tls::Version>, Error> {
    match self.settings.min_tls_version.as_deref() {
      None => Ok(None),
      Some("1.2") => Ok(Some(tls::Version::TLS_1_2)),
      Some("1.3") => Ok(Some(tls::Version::TLS_1_3)),
      Some(other) => Err(Error::Configuration(format!(
        "unsupported minimum TLS version {}",
        other
      ))),
    }
  }

  fn builder(&self) -> Result<reqwest::ClientBuilder, Error> {
    let mut builder = reqwest::Client::builder()
      .timeout(Duration::from_secs(self.settings.timeout))
      .user_agent(concat!(
        env!("CARGO_PKG_NAME"),
        "/",
        env!("CARGO_PKG_VERSION")
      ));
    if let Some(version) = self.min_tls()? {
      builder = builder.min_tls_version(version);
    }
    if let Some(proxy) = &self.settings.proxy {
      builder = builder.proxy(reqwest::Proxy::all(proxy.as_str())?);
    }
    Ok(builder)
  }

  /// A client with the configured timeout, TLS floor and proxy.
  pub fn client(&self) -> Result<reqwest::Client, Error> {
    Ok(self.builder()?.build()?)
  }

  /// A client that refuses anything newer than TLS 1.2, for endpoints
  /// that choke on a TLS 1.3 handshake.
  pub fn conservative_client(&self) -> Result<reqwest::Client, Error> {
    Ok(self.builder()?.max_tls_version(tls::Version::TLS_1_2).build()?)
  }

  /// Probes `base_uri` and returns the client that could reach it. When
  /// neither can, the default client is returned and the directory fetch
  /// reports the real error.
  #[instrument(level = Level::DEBUG, name = "acme2_lifecycle::HttpClientFactory::connect", err, skip(self))]
  pub async fn connect(&self, base_uri: &str) -> Result<reqwest::Client, Error> {
    let client = self.client()?;
    match probe(&client, base_uri).await {
      Ok(()) => return Ok(client),
      Err(err) => {
        debug!(error = %err, "Initial connection failed, retrying with TLS 1.2")
      }
    }

    let conservative = self.conservative_client()?;
    match probe(&conservative, base_uri).await {
      Ok(()) => {
        warn!("Connected only after limiting the connection to TLS 1.2");
        Ok(conservative)
      }
      Err(err) => {
        warn!(error = %err, url = base_uri, "Unable to reach the ACME server");
        Ok(client)
      }
    }
  }
}

async fn probe(client: &reqwest::Client, url: &str) -> Result<(), Error> {
  client.head(url).timeout(PROBE_TIMEOUT).send().await?;
  Ok(())
}
