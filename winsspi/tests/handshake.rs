use winsspi::{
    codec,
    mock::{MockProvider, Round},
    AuthIdentity, AuthStatus, ClientCtx, CtxFlags, Error, Mech, Qop, ServerCtx,
};

fn new_client(mock: &MockProvider) -> ClientCtx<MockProvider> {
    ClientCtx::init(
        mock.clone(),
        Mech::Kerberos,
        "svc@host.example.com",
        None,
        CtxFlags::default(),
        None,
    )
    .unwrap()
}

fn established_client(mock: &MockProvider) -> ClientCtx<MockProvider> {
    mock.script_initialize([Round::finished(b"greeting")]);
    let mut ctx = new_client(mock);
    assert_eq!(ctx.step("").unwrap(), AuthStatus::Complete);
    ctx
}

fn established_server(mock: &MockProvider, service: Option<&str>) -> ServerCtx<MockProvider> {
    mock.script_accept([Round::finished(b"")]);
    let mut srv = ServerCtx::init(mock.clone(), Mech::Kerberos, service).unwrap();
    assert_eq!(srv.step(&codec::encode(b"hello")).unwrap(), AuthStatus::Complete);
    srv
}

#[test]
fn end_to_end_handshake_reports_both_usernames() {
    let mock = MockProvider::new().with_username("u@REALM");
    mock.script_initialize([Round::partial(b"T1"), Round::finished(b"")]);
    mock.script_accept([Round::finished(b"T2")]);

    let identity = AuthIdentity {
        user: "u",
        domain: None,
        password: Some("p"),
    };
    let mut client = ClientCtx::init(
        mock.clone(),
        Mech::Kerberos,
        "service@host",
        None,
        CtxFlags::default(),
        Some(identity),
    )
    .unwrap();
    let mut server = ServerCtx::init(mock.clone(), Mech::Kerberos, None).unwrap();

    assert_eq!(client.step("").unwrap(), AuthStatus::Continue);
    assert_eq!(client.username(), None);
    let t1 = client.response().unwrap().to_string();
    assert_eq!(t1, codec::encode(b"T1"));

    assert_eq!(server.step(&t1).unwrap(), AuthStatus::Complete);
    assert_eq!(mock.accept_inputs(), vec![b"T1".to_vec()]);
    assert_eq!(server.username(), Some("u@REALM"));
    let t2 = server.response().unwrap().to_string();
    assert_eq!(t2, codec::encode(b"T2"));

    assert_eq!(client.step(&t2).unwrap(), AuthStatus::Complete);
    assert_eq!(client.response(), None);
    assert_eq!(client.username(), Some("u@REALM"));
    assert!(client.established() && server.established());
    assert_eq!(client.flags(), CtxFlags::default());
    // Both credential handles stay live alongside their context handles.
    assert_eq!(mock.live_handles(), 4);

    assert_eq!(mock.initialize_targets(), vec!["service/host", "service/host"]);
    assert_eq!(mock.initialize_inputs()[1].as_deref(), Some(&b"T2"[..]));
    let calls = mock.calls();
    assert_eq!(calls.initialize, 2);
    assert_eq!(calls.accept, 1);
    assert_eq!(calls.query_name, 2);
    assert_eq!(calls.query_target, 1);

    client.destroy();
    server.destroy();
    client.destroy();
    server.destroy();
    assert!(!client.established());
    assert_eq!(mock.live_handles(), 0);
    mock.assert_freed_once();
}

#[test]
fn protection_before_completion_is_rejected_without_provider_calls() {
    let mock = MockProvider::new();
    let mut client = new_client(&mock);
    let mut server = ServerCtx::init(mock.clone(), Mech::Kerberos, None).unwrap();
    assert!(!client.established() && !server.established());

    let data = codec::encode(b"data");
    assert!(matches!(
        client.wrap(&data, None, false).unwrap_err(),
        Error::UninitializedContext
    ));
    assert!(matches!(client.unwrap(&data).unwrap_err(), Error::UninitializedContext));
    assert!(matches!(server.impersonate().unwrap_err(), Error::UninitializedContext));
    assert!(matches!(server.revert().unwrap_err(), Error::UninitializedContext));

    let calls = mock.calls();
    assert_eq!(calls.encrypt, 0);
    assert_eq!(calls.decrypt, 0);
    assert_eq!(calls.impersonate, 0);
    assert_eq!(calls.revert, 0);
    assert_eq!(mock.live_handles(), 2);

    mock.script_initialize([Round::finished(b"t")]);
    mock.script_accept([Round::finished(b"")]);
    assert_eq!(client.step("").unwrap(), AuthStatus::Complete);
    assert_eq!(server.step(&codec::encode(b"t")).unwrap(), AuthStatus::Complete);
}

#[test]
fn each_successful_step_replaces_the_response() {
    let mock = MockProvider::new();
    mock.script_initialize([Round::partial(b"one"), Round::partial(b"two")]);
    let mut ctx = new_client(&mock);

    ctx.step("").unwrap();
    let first = ctx.response().unwrap().to_string();
    assert_eq!(first, codec::encode(b"one"));

    ctx.step(&codec::encode(b"challenge")).unwrap();
    assert_eq!(ctx.response(), Some(codec::encode(b"two").as_str()));
    assert_ne!(ctx.response(), Some(first.as_str()));
}

#[test]
fn wrap_frames_trailer_then_payload_then_padding() {
    let mock = MockProvider::new().with_sizes(16, 8);
    let mut ctx = established_client(&mock);

    let payload = b"attack at dawn";
    assert_eq!(ctx.wrap(&codec::encode(payload), None, false).unwrap(), AuthStatus::Complete);

    let frame = codec::decode(ctx.response().unwrap()).unwrap();
    assert_eq!(frame.len(), 16 + payload.len() + 8);
    assert_eq!(&frame[..16], [b'T'; 16]);
    assert_eq!(&frame[16..16 + payload.len()], payload);
    assert_eq!(&frame[16 + payload.len()..], [b'P'; 8]);
    assert_eq!(mock.encrypt_qops(), vec![Qop::Integrity]);
}

#[test]
fn wrap_of_an_empty_payload_is_trailer_and_padding_only() {
    let mock = MockProvider::new().with_sizes(16, 8);
    let mut ctx = established_client(&mock);

    assert_eq!(ctx.wrap(&codec::encode(b""), None, false).unwrap(), AuthStatus::Complete);

    let frame = codec::decode(ctx.response().unwrap()).unwrap();
    assert_eq!(frame.len(), 16 + 8);
    assert_eq!(&frame[..16], [b'T'; 16]);
    assert_eq!(&frame[16..], [b'P'; 8]);
}

#[test]
fn wrap_with_a_user_seals_the_authorization_payload() {
    let mock = MockProvider::new();
    let mut ctx = established_client(&mock);

    // `data` is not even valid base64; it must be ignored when a user is given.
    ctx.wrap("***", Some("alice"), false).unwrap();

    let mut want = vec![1, 0, 0, 0];
    want.extend_from_slice(b"alice");
    assert_eq!(mock.encrypt_payloads(), vec![want]);
}

#[test]
fn protect_selects_the_confidential_qop() {
    let mock = MockProvider::new();
    mock.script_initialize([Round::finished(b"t")]);
    let flags = CtxFlags::default() | CtxFlags::CONFIDENTIALITY;
    let mut ctx =
        ClientCtx::init(mock.clone(), Mech::Kerberos, "svc@host", None, flags, None).unwrap();
    ctx.step("").unwrap();

    ctx.wrap(&codec::encode(b"signed"), None, false).unwrap();
    ctx.wrap(&codec::encode(b"sealed"), None, true).unwrap();

    assert_eq!(mock.encrypt_qops(), vec![Qop::Integrity, Qop::Confidential]);
}

#[test]
fn unwrap_reports_payload_and_encryption_flag() {
    let mock = MockProvider::new();
    let mut ctx = established_client(&mock);

    mock.set_unsealed(b"secret", true);
    assert_eq!(ctx.unwrap(&codec::encode(b"sealed")).unwrap(), AuthStatus::Complete);
    let expected = codec::encode(b"secret");
    assert_eq!(ctx.response(), Some(expected.as_str()));
    assert!(ctx.response_encrypted());

    mock.set_unsealed(b"", false);
    ctx.unwrap(&codec::encode(b"sealed")).unwrap();
    assert_eq!(ctx.response(), None);
    assert!(!ctx.response_encrypted());
}

#[test]
fn encryption_flag_survives_wraps_and_resets_on_destroy() {
    let mock = MockProvider::new();
    let mut ctx = established_client(&mock);

    mock.set_unsealed(b"secret", true);
    ctx.unwrap(&codec::encode(b"sealed")).unwrap();
    assert!(ctx.response_encrypted());

    // Only the next unwrap may change the flag.
    ctx.wrap(&codec::encode(b"out"), None, false).unwrap();
    assert!(ctx.response_encrypted());

    ctx.destroy();
    assert!(!ctx.response_encrypted());
}

#[test]
fn bad_unwrap_input_leaves_the_session_usable() {
    let mock = MockProvider::new();
    let mut ctx = established_client(&mock);

    assert!(matches!(ctx.unwrap("***").unwrap_err(), Error::Decode(_)));
    assert_eq!(mock.calls().decrypt, 0);

    assert_eq!(ctx.wrap(&codec::encode(b"still fine"), None, false).unwrap(), AuthStatus::Complete);
}

#[test]
fn target_name_is_queried_only_without_an_explicit_service() {
    let mock = MockProvider::new().with_target("http/proxy.example.com");
    let srv = established_server(&mock, None);
    assert_eq!(srv.target_name(), Some("http/proxy.example.com"));
    assert_eq!(mock.calls().query_target, 1);

    let mock = MockProvider::new();
    let srv = established_server(&mock, Some("http@proxy"));
    assert_eq!(srv.target_name(), None);
    assert_eq!(mock.calls().query_target, 0);
    assert_eq!(mock.server_acquires(), vec![Some("http/proxy".to_string())]);
}

#[test]
fn encrypt_failure_poisons_the_session() {
    let mock = MockProvider::new();
    let mut ctx = established_client(&mock);

    mock.fail_encrypt(0x8009_0321_u32 as i32, "The buffers supplied to a function was too small");
    let data = codec::encode(b"x");
    let e1 = ctx.wrap(&data, None, false).unwrap_err();
    assert!(matches!(e1, Error::Provider { operation: "EncryptMessage", .. }));
    assert_eq!(mock.live_handles(), 0);

    let e2 = ctx.wrap(&data, None, false).unwrap_err();
    assert_eq!(e1.to_string(), e2.to_string());
    assert_eq!(mock.calls().encrypt, 1);
    mock.assert_freed_once();
}

#[test]
fn decrypt_failure_poisons_the_session() {
    let mock = MockProvider::new();
    let mut ctx = established_client(&mock);

    mock.fail_decrypt(0x8009_0308_u32 as i32, "The token supplied to the function is invalid");
    let sealed = codec::encode(b"tampered");
    let e1 = ctx.unwrap(&sealed).unwrap_err();
    assert!(matches!(e1, Error::Provider { operation: "DecryptMessage", .. }));
    assert_eq!(mock.live_handles(), 0);

    let e2 = ctx.unwrap(&sealed).unwrap_err();
    assert_eq!(e1.to_string(), e2.to_string());
    assert_eq!(mock.calls().decrypt, 1);
    mock.assert_freed_once();
}

#[test]
fn completion_name_query_failure_is_terminal() {
    let mock = MockProvider::new();
    mock.script_initialize([Round::finished(b"t")]);
    mock.fail_query_name(0x8009_0302_u32 as i32, "The function requested is not supported");
    let mut ctx = new_client(&mock);

    let err = ctx.step("").unwrap_err();
    assert!(matches!(err, Error::Provider { operation: "QueryContextAttributes", .. }));
    assert_eq!(ctx.username(), None);
    assert_eq!(mock.live_handles(), 0);
    mock.assert_freed_once();

    assert!(matches!(ctx.step("").unwrap_err(), Error::Provider { .. }));
}

#[test]
fn impersonation_round_trip() {
    let mock = MockProvider::new();
    let mut srv = established_server(&mock, Some("svc@host"));

    srv.impersonate().unwrap();
    srv.revert().unwrap();

    let calls = mock.calls();
    assert_eq!(calls.impersonate, 1);
    assert_eq!(calls.revert, 1);
}

#[test]
fn impersonation_failure_is_terminal() {
    let mock = MockProvider::new();
    let mut srv = established_server(&mock, Some("svc@host"));

    mock.fail_impersonate(
        0x8009_030b_u32 as i32,
        "No impersonation of a security context is allowed",
    );
    let e1 = srv.impersonate().unwrap_err();
    assert!(matches!(e1, Error::Provider { operation: "ImpersonateSecurityContext", .. }));
    assert_eq!(mock.live_handles(), 0);

    let e2 = srv.impersonate().unwrap_err();
    assert_eq!(e1.to_string(), e2.to_string());
    assert_eq!(mock.calls().impersonate, 1);
    mock.assert_freed_once();
}
