/// A unique identifier of a VM, of the form `vm-<xid>` when minted by [VmId::generate].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmId(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VmIdError {
    TooShort,
    TooLong,
    ContainsInvalidCharacter,
}

impl std::error::Error for VmIdError {}

impl std::fmt::Display for VmIdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmIdError::TooShort => write!(f, "The VM ID is shorter than 5 characters"),
            VmIdError::TooLong => write!(f, "The VM ID is longer than 60 characters"),
            VmIdError::ContainsInvalidCharacter => {
                write!(f, "The VM ID contains a character that is not alphanumeric or a dash")
            }
        }
    }
}

impl VmId {
    pub fn new(id: impl Into<String>) -> Result<VmId, VmIdError> {
        let id = id.into();

        if id.len() < 5 {
            return Err(VmIdError::TooShort);
        }

        if id.len() > 60 {
            return Err(VmIdError::TooLong);
        }

        if id.chars().any(|c| !c.is_ascii_alphanumeric() && c != '-') {
            return Err(VmIdError::ContainsInvalidCharacter);
        }

        Ok(Self(id))
    }

    /// Mint a new, globally unique [VmId].
    pub fn generate() -> VmId {
        Self(format!("vm-{}", xid::new()))
    }
}

impl AsRef<str> for VmId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<VmId> for String {
    fn from(value: VmId) -> Self {
        value.0
    }
}

impl TryFrom<String> for VmId {
    type Error = VmIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}
