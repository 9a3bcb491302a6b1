//! # Call Marshaling Protocol
//!
//! Every operation reaches the module through [`Marshal`]. Triple-returning
//! calls run as one scope: call, copy the payload into host memory, release the
//! native buffer, and only then look at the status word. The release happens
//! exactly once on every path, including protocol errors and decode failures.

use tracing::debug;
use tracing::warn;

use crate::abi::Abi;
use crate::abi::StatusCode;
use crate::module;
use crate::module::Arg;
use crate::module::NativeModule;

#[derive(Debug)]
pub enum Error {
    /// The module answered with status ERROR. Holds its diagnostic text.
    Protocol(String),
    Module(module::Error),
    /// A string payload was not valid UTF-8.
    Utf8(std::string::FromUtf8Error),
    /// A scalar-returning export produced no value.
    MissingResult(Abi),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol(msg) => f.write_str(msg),
            Self::Module(e) => write!(f, "{}", e),
            Self::Utf8(e) => write!(f, "Response is not valid UTF-8: {}", e),
            Self::MissingResult(abi) => write!(f, "'{}' returned no value", abi),
        }
    }
}

impl std::error::Error for Error {}

impl From<module::Error> for Error {
    fn from(e: module::Error) -> Self {
        Self::Module(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Marshals calls against a module the caller holds exclusively.
pub struct Marshal<'m> {
    module: &'m mut dyn NativeModule,
}

impl<'m> Marshal<'m> {
    pub fn new(module: &'m mut dyn NativeModule) -> Self {
        Self { module }
    }

    /// Triple call whose payload is a UTF-8 string.
    pub async fn string(&mut self, abi: Abi, args: &[Arg]) -> Result<String> {
        self.scoped(abi, args, |payload| String::from_utf8(payload).map_err(Error::Utf8))
            .await
    }

    /// Triple call whose payload is opaque bytes.
    pub async fn bytes(&mut self, abi: Abi, args: &[Arg]) -> Result<Vec<u8>> {
        self.scoped(abi, args, Ok).await
    }

    /// Triple call that carries no payload on success.
    pub async fn unit(&mut self, abi: Abi, args: &[Arg]) -> Result<()> {
        self.scoped(abi, args, |_| Ok(())).await
    }

    /// Plain call returning a number.
    pub async fn number(&mut self, abi: Abi, args: &[Arg]) -> Result<f64> {
        debug!(symbol = abi.symbol(), "call");
        self.module
            .call(abi.symbol(), args)
            .await?
            .ok_or(Error::MissingResult(abi))
    }

    /// Plain call without a result.
    pub async fn void(&mut self, abi: Abi, args: &[Arg]) -> Result<()> {
        debug!(symbol = abi.symbol(), "call");
        self.module.call(abi.symbol(), args).await?;
        Ok(())
    }

    async fn scoped<R>(
        &mut self,
        abi: Abi,
        args: &[Arg],
        decode: impl FnOnce(Vec<u8>) -> Result<R>,
    ) -> Result<R> {
        let triple = self.module.call_sret(abi.symbol(), args).await?;
        debug!(symbol = abi.symbol(), status = ?triple.status, len = triple.len, "response");

        let copied = self.module.read(triple.data, triple.len).await;
        let released = self.release().await;

        let payload = match (copied, released) {
            (Ok(payload), Ok(())) => payload,
            (Err(e), released) => {
                if let Err(release_err) = released {
                    warn!(symbol = abi.symbol(), error = %release_err, "release failed after copy error");
                }
                return Err(e.into());
            }
            (Ok(_), Err(e)) => return Err(e),
        };

        match triple.status {
            StatusCode::Error => Err(Error::Protocol(String::from_utf8_lossy(&payload).into_owned())),
            StatusCode::Success => decode(payload),
        }
    }

    async fn release(&mut self) -> Result<()> {
        self.module.call(Abi::ClearResponse.symbol(), &[]).await?;
        Ok(())
    }
}
