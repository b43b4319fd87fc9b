use url::Url;

use crate::error::Result;

/// Sends the user agent to the provider's authorization page.
pub trait UrlOpener: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the page could not be opened. The caller then
    /// asks the user to open it by hand.
    fn open(&self, url: &Url) -> Result<()>;
}

/// Opens URLs in the desktop's default browser.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemBrowser;

impl UrlOpener for SystemBrowser {
    fn open(&self, url: &Url) -> Result<()> {
        webbrowser::open(url.as_str())?;
        Ok(())
    }
}
