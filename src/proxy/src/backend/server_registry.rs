//! Plain backend server registry (SPEC_FULL.md §6, §10.C): the narrow
//! collaborator surface a monitor publishes into and the CLI/config layer
//! populates at startup. Replaces the teacher's cloud topology model
//! (`BackendInstance`/`TenantKey`/backend discovery) with a static list, since
//! monitor and topology discovery are out of scope here.

use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    Master,
    Slave,
}

#[derive(Debug, Clone)]
pub struct BackendServer {
    pub name: String,
    pub addr: SocketAddr,
    pub tier: u8,
    pub role: ServerRole,
}

impl BackendServer {
    pub fn new(name: impl Into<String>, addr: SocketAddr, tier: u8, role: ServerRole) -> Self {
        Self {
            name: name.into(),
            addr,
            tier,
            role,
        }
    }

    pub fn is_master(&self) -> bool {
        self.role == ServerRole::Master
    }
}

/// Parses `name:host:port:tier:role` entries as accepted by the
/// `--backend-server` CLI flag (SPEC_FULL.md §10.C), e.g.
/// `master:127.0.0.1:3306:0:master`.
pub fn parse_backend_server(spec: &str) -> Result<BackendServer, String> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() != 5 {
        return Err(format!(
            "expected name:host:port:tier:role, got {} fields in {spec:?}",
            parts.len()
        ));
    }
    let name = parts[0].to_string();
    let host = parts[1];
    let port: u16 = parts[2].parse().map_err(|_| format!("invalid port in {spec:?}"))?;
    let tier: u8 = parts[3].parse().map_err(|_| format!("invalid tier in {spec:?}"))?;
    let role = match parts[4].to_ascii_lowercase().as_str() {
        "master" => ServerRole::Master,
        "slave" => ServerRole::Slave,
        other => return Err(format!("unknown role {other:?} in {spec:?}")),
    };
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| format!("invalid address in {spec:?}: {e}"))?;
    Ok(BackendServer::new(name, addr, tier, role))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_entry() {
        let s = parse_backend_server("master:127.0.0.1:3306:0:master").unwrap();
        assert_eq!(s.name, "master");
        assert_eq!(s.tier, 0);
        assert!(s.is_master());
    }

    #[test]
    fn rejects_unknown_role() {
        assert!(parse_backend_server("x:127.0.0.1:3306:0:replica").is_err());
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(parse_backend_server("x:127.0.0.1:3306").is_err());
    }
}
