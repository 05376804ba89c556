use std::path::PathBuf;
use std::{error, fmt, io};
use util::diag::Diagnostics;

#[derive(Debug)]
pub enum AsmError {
    /// Reading the source or writing an output failed.
    Io(io::Error, PathBuf),
    /// Writing the object file failed.
    Object(tobjfile::ObjError),
    /// The assembly phase collected errors; all diagnostics are attached.
    Failed(Diagnostics),
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AsmError::Io(err, path) => {
                write!(f, "File \"{}\": {}", path.display(), err)
            }
            AsmError::Object(err) => write!(f, "{}", err),
            AsmError::Failed(diagnostics) => {
                write!(
                    f,
                    "Assembly failed with {} error(s)",
                    diagnostics.error_count()
                )?;
                for diagnostic in diagnostics.iter() {
                    write!(f, "\n{}", diagnostic)?;
                }
                Ok(())
            }
        }
    }
}

impl error::Error for AsmError {}

impl From<tobjfile::ObjError> for AsmError {
    fn from(err: tobjfile::ObjError) -> AsmError {
        AsmError::Object(err)
    }
}
