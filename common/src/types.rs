#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaterState {
    Off,
    On,
}

impl HeaterState {
    pub fn from_on(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }

    pub fn is_on(self) -> bool {
        self == Self::On
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Off => Self::On,
            Self::On => Self::Off,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::On => "on",
        }
    }
}
