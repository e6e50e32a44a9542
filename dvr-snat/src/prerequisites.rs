use dvr::DvrError;

use crate::command::{Privilege, exec};
use crate::config::SnatConfig;

/// Verify that the host can run the Linux backends.
///
/// Checks the iproute2, iptables, sysctl and arping commands, and sudo access
/// when commands run privileged. Collects all failures and returns them in a
/// single `BackendNotAvailable` error.
pub async fn check_prerequisites(config: &SnatConfig, privilege: Privilege) -> Result<(), DvrError> {
    let mut errors = Vec::new();

    check_required_commands(config, &mut errors);
    if privilege == Privilege::Sudo {
        check_sudo(&mut errors).await;
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(DvrError::BackendNotAvailable(errors.join("; ")))
    }
}

fn required_commands(config: &SnatConfig) -> Vec<&'static str> {
    let mut commands = vec!["ip", "iptables", "iptables-restore", "sysctl", "arping"];
    if config.use_ipv6 {
        commands.extend(["ip6tables", "ip6tables-restore"]);
    }
    commands
}

fn check_required_commands(config: &SnatConfig, errors: &mut Vec<String>) {
    for cmd in required_commands(config) {
        if which::which(cmd).is_err() {
            errors.push(format!("required command not found: {cmd}"));
        }
    }
}

async fn check_sudo(errors: &mut Vec<String>) {
    if exec("sudo", &["-n", "true"], Privilege::User)
        .await
        .is_err()
    {
        errors.push(
            "root/sudo access required for namespace configuration; \
             please run with sudo or configure sudoers"
                .to_string(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EdgeMode;

    #[test]
    fn ipv6_adds_ip6tables_commands() {
        let mut config = SnatConfig::new("host", EdgeMode::Local);
        assert!(required_commands(&config).contains(&"ip6tables-restore"));
        config.use_ipv6 = false;
        let commands = required_commands(&config);
        assert!(!commands.contains(&"ip6tables-restore"));
        assert!(commands.contains(&"arping"));
    }

    #[test]
    fn missing_commands_are_collected() {
        let mut errors = Vec::new();
        let config = SnatConfig::new("host", EdgeMode::Centralized);
        check_required_commands(&config, &mut errors);
        for error in &errors {
            assert!(error.starts_with("required command not found: "), "{error}");
        }
    }
}
