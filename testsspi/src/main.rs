//! Loopback exercise against the live Windows security packages.
//!
//! Negotiates a client and a server context inside one process, prints
//! the identities both sides report, then runs a message through the
//! security layer with and without confidentiality. The target is taken
//! from the first argument, falling back to the current user name so
//! the Negotiate package can authenticate the process to itself.

#[cfg(windows)]
fn run() -> winsspi::Result<()> {
    use winsspi::{codec, AuthStatus, ClientCtx, CtxFlags, Error, Mech, Registry, ServerCtx, Sspi};

    let target = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("USERNAME").ok())
        .unwrap_or_else(|| "host/localhost".to_string());
    println!("negotiating against {target}");

    let mut clients: Registry<ClientCtx<Sspi>> = Registry::new();
    let mut servers: Registry<ServerCtx<Sspi>> = Registry::new();
    let flags = CtxFlags::default() | CtxFlags::CONFIDENTIALITY;
    let client =
        clients.insert(ClientCtx::init(Sspi, Mech::Negotiate, &target, None, flags, None)?);
    let server = servers.insert(ServerCtx::init(Sspi, Mech::Negotiate, None)?);

    let mut round = 0;
    let mut status = clients
        .get_mut(client)
        .ok_or(Error::UninitializedContext)?
        .step("")?;
    loop {
        round += 1;
        let token = clients
            .get(client)
            .and_then(|c| c.response())
            .unwrap_or("")
            .to_string();
        if !token.is_empty() {
            println!("round {round}: client sent {} base64 chars", token.len());
            servers
                .get_mut(server)
                .ok_or(Error::UninitializedContext)?
                .step(&token)?;
        }
        if status == AuthStatus::Complete {
            break;
        }
        let reply = servers
            .get(server)
            .and_then(|s| s.response())
            .unwrap_or("")
            .to_string();
        println!("round {round}: server sent {} base64 chars", reply.len());
        status = clients
            .get_mut(client)
            .ok_or(Error::UninitializedContext)?
            .step(&reply)?;
    }

    {
        let srv = servers.get(server).ok_or(Error::UninitializedContext)?;
        println!(
            "server accepted {} (target {})",
            srv.username().unwrap_or("<unknown>"),
            srv.target_name().unwrap_or("<none>"),
        );
    }
    let ctx = clients.get_mut(client).ok_or(Error::UninitializedContext)?;
    println!("client authenticated as {}", ctx.username().unwrap_or("<unknown>"));

    let message = codec::encode(b"ping across the security layer");
    for protect in [false, true] {
        ctx.wrap(&message, None, protect)?;
        let sealed = ctx.response().unwrap_or("").to_string();
        println!("wrap(protect = {protect}) produced {} base64 chars", sealed.len());
        ctx.unwrap(&sealed)?;
        let recovered = match ctx.response() {
            Some(r) => codec::decode(r)?,
            None => Vec::new(),
        };
        println!(
            "unwrap recovered {} bytes, encrypted: {}",
            recovered.len(),
            ctx.response_encrypted()
        );
    }
    Ok(())
}

#[cfg(windows)]
fn main() {
    tracing_subscriber::fmt::init();
    match run() {
        Ok(()) => (),
        Err(e) => {
            println!("{e}");
            std::process::exit(1);
        }
    }
}

#[cfg(not(windows))]
fn main() {
    eprintln!("testsspi drives the native Windows security packages and only runs there");
    std::process::exit(1);
}
