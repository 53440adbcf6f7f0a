use crate::error::Error;
use async_trait::async_trait;

/// How the bootstrapper talks to an operator. Only used on first run; once
/// an account exists nothing here is called.
#[async_trait]
pub trait InputService: Send + Sync {
  /// Whether someone is there to answer. When this is false the other
  /// methods are not called.
  fn is_interactive(&self) -> bool;

  async fn request_string(&self, what: &str) -> Result<String, Error>;

  /// Reads a secret without echoing it. `None` if the operator gave nothing.
  async fn read_password(&self, what: &str) -> Result<Option<String>, Error>;

  async fn prompt_yes_no(&self, message: &str, default: bool) -> Result<bool, Error>;

  /// Lets the operator pick one of `options`. `None` means cancel.
  async fn choose_from_menu(
    &self,
    what: &str,
    options: &[String],
  ) -> Result<Option<usize>, Error>;
}

/// The input service of scheduled runs: nobody is there.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unattended;

#[async_trait]
impl InputService for Unattended {
  fn is_interactive(&self) -> bool {
    false
  }

  async fn request_string(&self, _what: &str) -> Result<String, Error> {
    Ok(String::new())
  }

  async fn read_password(&self, _what: &str) -> Result<Option<String>, Error> {
    Ok(None)
  }

  async fn prompt_yes_no(&self, _message: &str, default: bool) -> Result<bool, Error> {
    Ok(default)
  }

  async fn choose_from_menu(
    &self,
    _what: &str,
    _options: &[String],
  ) -> Result<Option<usize>, Error> {
    Ok(None)
  }
}
