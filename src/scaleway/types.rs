//! String newtypes for values read back from the Instances API.

use std::fmt;

macro_rules! api_string {
    ($name:ident) => {
        #[derive(Clone, Debug, Eq, PartialEq)]
        pub(crate) struct $name(String);

        impl $name {
            pub(crate) const fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

api_string!(InstanceId);
api_string!(Zone);
api_string!(InstanceState);
api_string!(Action);

impl InstanceState {
    pub(crate) fn is_running(&self) -> bool {
        self.0 == "running"
    }
}

impl Action {
    pub(crate) fn is_power_on(&self) -> bool {
        self.0 == "poweron"
    }
}
