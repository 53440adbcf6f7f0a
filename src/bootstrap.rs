use crate::account::Account;
use crate::account::AccountDetails;
use crate::account::AccountStore;
use crate::directory::DirectoryBuilder;
use crate::eab::EabAlgorithm;
use crate::eab::EabCredentialExchange;
use crate::eab::EabCredentials;
use crate::error::*;
use crate::helpers::*;
use crate::http::HttpClientFactory;
use crate::input::InputService;
use crate::input::Unattended;
use crate::session::Session;
use crate::settings::Settings;
use crate::signer::KeyType;
use crate::signer::Signer;
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;
use tracing::Level;

const MAILTO: &str = "mailto:";
const EMAIL_PATTERN: &str = r"^[^@\s]+@[^@\s]+\.[^@\s]+$";
const TERMS_FILE: &str = "terms-of-service";

/// Validates email addresses and turns them into `mailto:` URIs. Invalid
/// addresses are dropped with a warning.
pub fn normalize_contacts(addresses: &[String]) -> Result<Vec<String>, Error> {
  let pattern = Regex::new(EMAIL_PATTERN).map_err(|err| Error::Other(Box::new(err)))?;
  let mut contacts = vec![];
  for address in addresses {
    let address = address.trim();
    let bare = address.strip_prefix(MAILTO).unwrap_or(address);
    if bare.is_empty() {
      continue;
    }
    if !pattern.is_match(bare) {
      warn!(address = bare, "Ignoring invalid contact address");
      continue;
    }
    let contact = format!("{}{}", MAILTO, bare);
    if !contacts.contains(&contact) {
      contacts.push(contact);
    }
  }
  Ok(contacts)
}

/// The file name to save the terms at `url` under: the last path segment,
/// or a fixed name when that is missing or not a plain file name.
fn terms_file_name(url: &str) -> String {
  reqwest::Url::parse(url)
    .ok()
    .and_then(|url| url.path_segments()?.last().map(str::to_string))
    .filter(|name| {
      !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
    })
    .unwrap_or_else(|| TERMS_FILE.to_string())
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum BootstrapState {
  FetchDirectory,
  AcceptTerms,
  ResolveEab,
  ResolveContacts,
  CreateAccount,
  Done,
}

/// What has been settled so far about the account to create.
#[derive(Default)]
struct Progress {
  session: Option<Arc<Session>>,
  terms_agreed: bool,
  eab: Option<EabCredentials>,
  contacts: Vec<String>,
}

impl Progress {
  fn session(&self) -> Result<&Arc<Session>, Error> {
    self
      .session
      .as_ref()
      .ok_or_else(|| Error::Configuration("no session has been established".to_string()))
  }
}

/// Establishes an authenticated session: directory, terms of service,
/// external account binding, contacts and finally the account itself. A
/// stored account short-circuits everything after the directory.
pub struct Bootstrapper {
  settings: Arc<Settings>,
  store: AccountStore,
  http_client: Option<reqwest::Client>,
  input: Arc<dyn InputService>,
  exchanges: Vec<Arc<dyn EabCredentialExchange>>,
}

impl Bootstrapper {
  pub fn new(settings: Arc<Settings>, store: AccountStore) -> Self {
    Bootstrapper {
      settings,
      store,
      http_client: None,
      input: Arc::new(Unattended),
      exchanges: vec![],
    }
  }

  /// Uses this client instead of probing the CA for one.
  pub fn http_client(&mut self, http_client: reqwest::Client) -> &mut Self {
    self.http_client = Some(http_client);
    self
  }

  pub fn input(&mut self, input: Arc<dyn InputService>) -> &mut Self {
    self.input = input;
    self
  }

  /// Offers `exchange` when the CA requires external account binding and no
  /// credentials are configured.
  pub fn eab_exchange(&mut self, exchange: Arc<dyn EabCredentialExchange>) -> &mut Self {
    self.exchanges.push(exchange);
    self
  }

  #[instrument(level = Level::INFO, name = "acme2_lifecycle::Bootstrapper::run", err, skip(self), fields(base_uri = %self.settings.base_uri))]
  pub async fn run(&self) -> Result<Arc<Session>, Error> {
    let mut progress = Progress::default();
    let mut state = BootstrapState::FetchDirectory;
    loop {
      debug!(state = ?state, "Bootstrap step");
      state = match state {
        BootstrapState::FetchDirectory => {
          let session = Arc::new(self.fetch_directory().await?);
          let next = match self.store.load_default().await {
            Some(account) => {
              session.set_account(Arc::new(account)).await;
              BootstrapState::Done
            }
            None => BootstrapState::AcceptTerms,
          };
          progress.session = Some(session);
          next
        }
        BootstrapState::AcceptTerms => {
          progress.terms_agreed = self.accept_terms(progress.session()?).await?;
          BootstrapState::ResolveEab
        }
        BootstrapState::ResolveEab => self.resolve_eab(&mut progress).await?,
        BootstrapState::ResolveContacts => {
          progress.contacts = self.resolve_contacts().await?;
          BootstrapState::CreateAccount
        }
        BootstrapState::CreateAccount => {
          self.create_account(&progress).await?;
          BootstrapState::Done
        }
        BootstrapState::Done => break,
      };
    }

    progress.session.ok_or_else(|| {
      Error::Configuration("no session has been established".to_string())
    })
  }

  async fn fetch_directory(&self) -> Result<Session, Error> {
    let http_client = match &self.http_client {
      Some(http_client) => http_client.clone(),
      None => {
        HttpClientFactory::new(self.settings.http.clone())
          .connect(&self.settings.base_uri)
          .await?
      }
    };
    let directory = DirectoryBuilder::new(self.settings.base_uri.clone())
      .http_client(http_client.clone())
      .build()
      .await?;
    Ok(Session::new(http_client, directory))
  }

  /// Saves the terms next to the configuration so the operator can read
  /// them. Returns where they can be found.
  async fn download_terms(&self, session: &Session, url: &str) -> String {
    let path: PathBuf = self.settings.config_path.join(terms_file_name(url));
    let result = match session.download(url).await {
      Ok(document) => write_file_replace(&path, &document, false).await,
      Err(err) => Err(err),
    };
    match result {
      Ok(()) => {
        info!(path = %path.display(), "Saved terms of service");
        path.display().to_string()
      }
      Err(err) => {
        warn!(error = %err, url, "Unable to download terms of service");
        url.to_string()
      }
    }
  }

  async fn accept_terms(&self, session: &Session) -> Result<bool, Error> {
    let url = match session.directory().terms_of_service() {
      Some(url) => url.to_string(),
      None => {
        debug!("The CA publishes no terms of service");
        return Ok(true);
      }
    };
    if self.settings.terms_of_service_agreed {
      info!(url = %url, "Terms of service accepted in configuration");
      return Ok(true);
    }
    if !self.input.is_interactive() {
      error!(url = %url, "The terms of service must be accepted in the configuration for unattended runs");
      return Err(Error::TermsNotAccepted);
    }

    let location = self.download_terms(session, &url).await;
    let agreed = self
      .input
      .prompt_yes_no(
        &format!("Do you agree with the terms of service at {}?", location),
        false,
      )
      .await?;
    if !agreed {
      return Err(Error::TermsNotAccepted);
    }
    Ok(true)
  }

  async fn resolve_eab(&self, progress: &mut Progress) -> Result<BootstrapState, Error> {
    let required = progress.session()?.directory().external_account_required();
    let configured = self.settings.eab.clone();
    if !required && configured.is_none() {
      return Ok(BootstrapState::ResolveContacts);
    }
    if !required {
      warn!("External account binding credentials were supplied though the CA does not require them, using them anyway");
    }

    if let Some(credentials) = configured {
      EabAlgorithm::parse(&credentials.algorithm)?;
      progress.eab = Some(credentials);
      return Ok(BootstrapState::ResolveContacts);
    }

    if self.input.is_interactive() {
      if let Some(credentials) = self.prompt_eab().await? {
        EabAlgorithm::parse(&credentials.algorithm)?;
        let next = match &credentials.contact {
          Some(contact) => {
            progress.contacts = normalize_contacts(&[contact.clone()])?;
            BootstrapState::CreateAccount
          }
          None => BootstrapState::ResolveContacts,
        };
        progress.eab = Some(credentials);
        return Ok(next);
      }
    }

    warn!("The CA requires external account binding but no credentials are available");
    Ok(BootstrapState::CreateAccount)
  }

  async fn prompt_eab(&self) -> Result<Option<EabCredentials>, Error> {
    let choice = if self.exchanges.is_empty() {
      Some(0)
    } else {
      let mut options = vec!["Enter key identifier and key".to_string()];
      options.extend(self.exchanges.iter().map(|exchange| exchange.label().to_string()));
      self
        .input
        .choose_from_menu("How do you want to link your account?", &options)
        .await?
    };

    match choice {
      None => Ok(None),
      Some(0) => {
        let key_identifier = self.input.request_string("Key identifier").await?;
        let key = self.input.read_password("Key (base64url encoded)").await?;
        match key {
          Some(key) if !key_identifier.trim().is_empty() && !key.trim().is_empty() => {
            Ok(Some(EabCredentials {
              key_identifier: key_identifier.trim().to_string(),
              key: key.trim().to_string(),
              algorithm: EabAlgorithm::Hs256.name().to_string(),
              contact: None,
            }))
          }
          _ => Ok(None),
        }
      }
      Some(index) => {
        let exchange = self.exchanges.get(index - 1).ok_or_else(|| {
          Error::Configuration(format!("no credential exchange at menu position {}", index))
        })?;
        let answer = if exchange.secret_input() {
          self.input.read_password(exchange.prompt()).await?
        } else {
          Some(self.input.request_string(exchange.prompt()).await?)
        };
        match answer {
          Some(answer) if !answer.trim().is_empty() => {
            info!(exchange = exchange.label(), "Requesting external account binding credentials");
            Ok(Some(exchange.exchange(answer.trim()).await?))
          }
          _ => Ok(None),
        }
      }
    }
  }

  async fn resolve_contacts(&self) -> Result<Vec<String>, Error> {
    let addresses = if !self.settings.contacts.is_empty() {
      self.settings.contacts.clone()
    } else if self.input.is_interactive() {
      self
        .input
        .request_string("Email address(es) for notifications about problems and abuse (comma separated)")
        .await?
        .split(',')
        .map(str::to_string)
        .collect()
    } else {
      vec![]
    };

    let contacts = normalize_contacts(&addresses)?;
    if contacts.is_empty() {
      warn!("No valid contact address, the account will be created without one");
    }
    Ok(contacts)
  }

  async fn register(
    &self,
    session: &Session,
    key_type: KeyType,
    progress: &Progress,
  ) -> Result<(Signer, AccountDetails), Error> {
    let signer = Signer::create(key_type)?;
    let details = session
      .create_account(
        &signer,
        &progress.contacts,
        progress.terms_agreed,
        progress.eab.as_ref(),
      )
      .await?;
    Ok((signer, details))
  }

  async fn create_account(&self, progress: &Progress) -> Result<(), Error> {
    let session = progress.session()?;
    let key_type = self.settings.default_key_type;
    let (signer, details) = match self.register(session, key_type, progress).await {
      Ok(registered) => registered,
      Err(err) if err.problem_kind() == Some(ProblemKind::BadSignatureAlgorithm) => {
        let fallback = key_type.fallback();
        warn!(rejected = %key_type, fallback = %fallback, "The CA rejected the account key algorithm, retrying once");
        self.register(session, fallback, progress).await?
      }
      Err(err) => return Err(err),
    };

    let account = Arc::new(Account { details, signer });
    self.store.save_default(&account).await?;
    info!(account = %account.id(), "Created account");
    session.set_account(account).await;
    Ok(())
  }
}
