//! Node imaging: turn a fresh cloud server into a Talos node
//!
//! The server is created from a stock image, booted into the provider's rescue
//! system and has the Talos disk image written over its primary disk. Only
//! then does it get its role labels and boot into Talos. The steps run
//! strictly in order and nothing is rolled back; a half-imaged server stays
//! around for inspection or a later delete.
//!
//! ```text
//! Created -> Networked -> RescueBooted -> Imaged -> PoweredOff -> Finalized
//! ```

use tracing::{debug, info, warn};

use hct_common::labels;
use hct_common::retry::retry;
use hct_common::{Error, Result};

use crate::cloud::{
    Labels, Network, PlacementGroup, Server, ServerSpec, ServerStatus, SshKey, SshKeySpec,
};
use crate::context::Context;
use crate::remote::{SshKeyPair, SSH_PORT};
use crate::templates::{random_suffix, ServerImageTemplate, INIT_IMAGE};

/// Block device the Talos image is written to
pub const TARGET_DEVICE: &str = "/dev/sda";

/// Remote command downloading the compressed image and writing it raw to disk
///
/// Any failing stage, including a download or decompression failure inside
/// the pipeline, makes the whole command exit non-zero.
pub fn flash_command(image_url: &str) -> String {
    format!(
        "set -eu -o pipefail; cd /tmp; wget -O /tmp/image.xz {image_url} && xz -d -c /tmp/image.xz | dd of={TARGET_DEVICE} && sync"
    )
}

/// Create a server from `template` and image it with Talos
///
/// A disposable SSH key is registered for the rescue session and removed
/// again whether or not imaging succeeded. The returned server carries its
/// final labels.
pub async fn create_server_from_image(
    ctx: &Context,
    network: &Network,
    placement_group: Option<&PlacementGroup>,
    template: &ServerImageTemplate,
) -> Result<Server> {
    let key_name = format!("{}-init-{}", template.name, random_suffix(8));
    let key_pair = SshKeyPair::generate(&key_name);
    let key_spec = SshKeySpec {
        name: key_name.clone(),
        public_key: key_pair.public_key_openssh(),
        labels: template.base_labels.clone(),
    };
    let ssh_key = retry(&ctx.fast, "create ssh key", || {
        ctx.cloud.create_ssh_key(&key_spec)
    })
    .await?;

    let result = image_server(ctx, network, placement_group, template, &ssh_key, &key_pair).await;

    let key_id = ssh_key.id;
    if let Err(e) = retry(&ctx.fast, "delete ssh key", || ctx.cloud.delete_ssh_key(key_id)).await
    {
        warn!(ssh_key = %key_name, error = %e, "Failed to delete disposable SSH key");
    }
    result
}

async fn image_server(
    ctx: &Context,
    network: &Network,
    placement_group: Option<&PlacementGroup>,
    template: &ServerImageTemplate,
    ssh_key: &SshKey,
    key_pair: &SshKeyPair,
) -> Result<Server> {
    let name = template.name.as_str();
    let spec = ServerSpec {
        name: template.name.clone(),
        server_type: template.server_type.clone(),
        image: INIT_IMAGE.to_string(),
        location: ctx.state.hcloud.location.clone(),
        placement_group: placement_group.map(|pg| pg.id),
        networks: vec![network.id],
        start_after_create: false,
        user_data: template.user_data.clone(),
        ssh_keys: vec![ssh_key.id],
        labels: template.base_labels.clone(),
    };
    let server = ctx.cloud.create_server(&spec).await?;
    let id = server.id;
    info!(server = %name, id, "Created server");

    let server = retry(&ctx.fast, "wait for private IP", move || async move {
        let server = ctx.cloud.get_server_by_id(id).await?;
        match server.private_ip() {
            Some(_) => Ok(server),
            None => Err(Error::pending(format!(
                "server {} has no private IP yet",
                server.name
            ))),
        }
    })
    .await?;
    let host = server
        .public_ipv4
        .clone()
        .ok_or_else(|| Error::not_found("server public IP", name))?;
    debug!(server = %name, private_ip = server.private_ip().unwrap_or_default(), "Server networked");

    let keys = [ssh_key.id];
    retry(&ctx.fast, "enable rescue", || ctx.cloud.enable_rescue(id, &keys)).await?;
    retry(&ctx.fast, "power on into rescue", || ctx.cloud.power_on(id)).await?;
    retry(&ctx.slow, "wait for rescue ssh", || {
        ctx.remote.execute(&host, SSH_PORT, key_pair, "true")
    })
    .await?;
    info!(server = %name, "Server booted into rescue system");

    let command = flash_command(&template.image_url);
    retry(&ctx.fast, "flash talos image", || {
        ctx.remote.execute(&host, SSH_PORT, key_pair, &command)
    })
    .await?;
    info!(server = %name, image = %template.image_url, "Talos image written");

    retry(&ctx.fast, "shutdown", || ctx.cloud.shutdown(id)).await?;
    let powered_off = retry(&ctx.fast, "wait for power off", move || async move {
        let server = ctx.cloud.get_server_by_id(id).await?;
        if server.status == ServerStatus::Off {
            Ok(())
        } else {
            Err(Error::pending(format!(
                "server {} is {:?}",
                server.name, server.status
            )))
        }
    })
    .await;
    if let Err(e) = powered_off {
        warn!(server = %name, error = %e, "Server did not report power off, continuing");
    }

    let final_labels: Labels = template
        .base_labels
        .iter()
        .chain(template.finalize_labels.iter())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    retry(&ctx.fast, "finalize labels", || {
        ctx.cloud.update_server_labels(id, &final_labels)
    })
    .await?;
    retry(&ctx.fast, "power on", || ctx.cloud.power_on(id)).await?;
    info!(
        server = %name,
        role = template.finalize_labels.get(labels::ROLE_LABEL).map(String::as_str).unwrap_or_default(),
        "Server finalized"
    );

    retry(&ctx.fast, "get server", || ctx.cloud.get_server_by_id(id)).await
}
