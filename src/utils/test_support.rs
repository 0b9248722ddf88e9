/// Returns `true` when upstream mocks cannot listen on loopback, e.g. inside
/// a network sandbox.
pub fn should_skip_httpmock() -> bool {
    if loopback_available() {
        return false;
    }
    eprintln!("skipping upstream mock test: binding 127.0.0.1 is not permitted");
    true
}

fn loopback_available() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(_listener) => true,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(err) => panic!("failed to check loopback for upstream mocks: {err}"),
    }
}
