use anyhow::{Context as _, bail};
use nimbus_core::config::ProviderSettings;
use nimbus_core::{Bus, Call, CallError, Credentials, Message, PeerInfo, ReplyBody, StorageError};
use nimbus_local::LocalProvider;
use nimbus_provider::{FixedAuthenticator, Server};
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

const SERVICE: &str = "com.nimbus.Local.Test";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("nimbus=debug"))
        .with_test_writer()
        .try_init();
}

fn serve(root: &TempDir) -> anyhow::Result<Bus> {
    init_tracing();
    let bus = Bus::new();
    let provider = Arc::new(LocalProvider::new(root.path(), 100)?);
    let settings = ProviderSettings {
        service_name: SERVICE.to_string(),
        ..ProviderSettings::default()
    };
    let server = Server::new(
        &bus,
        provider,
        Arc::new(FixedAuthenticator::new(Credentials::None)),
        &settings,
    )?;
    server.spawn();
    Ok(bus)
}

async fn call(conn: &nimbus_core::Connection, call: &Call) -> anyhow::Result<(ReplyBody, Message)> {
    let reply = conn.call(SERVICE, Message::encode(call)?).await?;
    Ok((reply.decode()?, reply))
}

#[tokio::test]
async fn upload_through_the_server_lands_on_disk() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let bus = serve(&tmp)?;
    let conn = bus.connect(PeerInfo::new(1000, 99, "unconfined"));

    let (roots, _) = call(&conn, &Call::Roots).await?;
    let ReplyBody::Items(roots) = roots else {
        bail!("unexpected roots reply");
    };
    let root_id = roots[0].item_id.clone();

    let (body, mut reply) = call(
        &conn,
        &Call::CreateFile {
            parent_id: root_id.clone(),
            name: "hello.txt".into(),
            size: 5,
            content_type: "text/plain".into(),
            allow_overwrite: false,
        },
    )
    .await?;
    let ReplyBody::Transfer { id } = body else {
        bail!("unexpected create reply");
    };
    let mut channel = UnixStream::from(reply.fds.pop().context("no descriptor")?);
    channel.write_all(b"hello")?;
    drop(channel);

    let (body, _) = call(&conn, &Call::FinishUpload { upload_id: id }).await?;
    let ReplyBody::Item(item) = body else {
        bail!("unexpected finish reply");
    };
    assert_eq!(item.name, "hello.txt");
    assert_eq!(item.parent_ids, vec![root_id]);
    assert_eq!(std::fs::read(tmp.path().join("hello.txt"))?, b"hello");
    Ok(())
}

#[tokio::test]
async fn backend_errors_keep_their_kind_on_the_wire() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let bus = serve(&tmp)?;
    let conn = bus.connect(PeerInfo::new(1000, 99, "unconfined"));
    let root_id = std::fs::canonicalize(tmp.path())?
        .to_string_lossy()
        .into_owned();

    let missing = format!("{root_id}/missing");
    match call(&conn, &Call::Metadata { item_id: missing.clone() }).await {
        Err(e) => match e.downcast::<CallError>()? {
            CallError::Remote(wire) => match wire.into_storage_error() {
                StorageError::NotExists { key, .. } => assert_eq!(key, missing),
                other => bail!("unexpected {other:?}"),
            },
            other => bail!("unexpected {other:?}"),
        },
        Ok(_) => bail!("metadata of a missing item succeeded"),
    }

    match call(&conn, &Call::Delete { item_id: root_id }).await {
        Err(e) => {
            let CallError::Remote(wire) = e.downcast::<CallError>()? else {
                bail!("not an error reply");
            };
            assert_eq!(wire.name, "PermissionException");
        }
        Ok(_) => bail!("root was deleted"),
    }
    Ok(())
}
