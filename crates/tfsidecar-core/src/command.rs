//! The terraform commands the supervisor knows how to run.

use std::fmt;

use crate::paths::PathSet;

/// State versions with this prefix predate the provider source address
/// syntax and need their provider references rewritten before newer
/// terraform releases will touch the state.
pub const LEGACY_VERSION_PREFIX: &str = "0.12.";

/// Provider name to source address mapping applied when migrating a
/// legacy state (`registry.terraform.io/-/<name>` to
/// `registry.terraform.io/<source>`).
pub const LEGACY_PROVIDER_REPLACEMENTS: [(&str, &str); 8] = [
    ("aws", "hashicorp/aws"),
    ("azurerm", "hashicorp/azurerm"),
    ("google", "hashicorp/google"),
    ("google-beta", "hashicorp/google-beta"),
    ("openstack", "terraform-provider-openstack/openstack"),
    ("alicloud", "hashicorp/alicloud"),
    ("template", "hashicorp/template"),
    ("null", "hashicorp/null"),
];

/// A terraform command.
///
/// Only [`Command::Apply`], [`Command::Destroy`] and [`Command::Validate`]
/// can be requested by the user; the remaining commands are issued
/// internally by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// `terraform init`.
    Init,
    /// `terraform plan`.
    Plan,
    /// `terraform apply`.
    Apply,
    /// `terraform destroy`.
    Destroy,
    /// `terraform validate`.
    Validate,
    /// `terraform state replace-provider`.
    StateReplaceProvider,
}

impl Command {
    /// The argv tokens naming this command.
    #[must_use]
    pub const fn tokens(self) -> &'static [&'static str] {
        match self {
            Self::Init => &["init"],
            Self::Plan => &["plan"],
            Self::Apply => &["apply"],
            Self::Destroy => &["destroy"],
            Self::Validate => &["validate"],
            Self::StateReplaceProvider => &["state", "replace-provider"],
        }
    }

    /// Returns `true` if the command may be requested by the user.
    #[must_use]
    pub const fn is_user_invokable(self) -> bool {
        matches!(self, Self::Apply | Self::Destroy | Self::Validate)
    }

    /// Build the full terraform argument list for this command.
    ///
    /// The working directory is passed via `-chdir`, followed by the
    /// command tokens, the command-specific flags and finally any
    /// positional parameters.
    #[must_use]
    pub fn cli_args(self, paths: &PathSet, positional: &[String]) -> Vec<String> {
        let mut args = vec![format!("-chdir={}", paths.config_dir.display())];
        args.extend(self.tokens().iter().map(|t| (*t).to_owned()));
        args.push("-no-color".to_owned());

        let var_file = || format!("-var-file={}", paths.vars_path.display());
        let state = || format!("-state={}", paths.state_path.display());

        match self {
            Self::Init | Self::Validate => {}
            Self::Plan => {
                args.push(var_file());
                args.push("-parallelism=4".to_owned());
                args.push("-detailed-exitcode".to_owned());
                args.push(state());
            }
            Self::Apply | Self::Destroy => {
                args.push(var_file());
                args.push("-parallelism=4".to_owned());
                args.push("-auto-approve".to_owned());
                args.push(state());
            }
            Self::StateReplaceProvider => {
                args.push("-auto-approve".to_owned());
                args.push(state());
            }
        }

        args.extend(positional.iter().cloned());
        args
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tokens().join(" "))
    }
}
