use facet_value::{VArray, Value, value};

use crate::config::{SSH_USER, VmConfig};

/// Mount tag for the workspace passthrough filesystem, referenced both by
/// domain creation and by the guest's fstab entry.
pub const WORKSPACE_TAG: &str = "workspace";

/// Where the workspace lands inside the guest.
pub const WORKSPACE_GUEST_PATH: &str = "/workspace";

/// Render the `#cloud-config` user-data a freshly provisioned VM boots with.
///
/// The guest agent is installed and enabled on first boot so later address
/// queries can answer, and the generated public key is authorized for the
/// login user.
pub fn build_user_data(config: &VmConfig, ssh_pubkey: &str) -> String {
    let keys = VArray::from_iter([Value::from(ssh_pubkey)]);
    let user = value!({
        "name": (Value::from(SSH_USER)),
        "shell": "/bin/bash",
        "sudo": "ALL=(ALL) NOPASSWD:ALL",
        "ssh_authorized_keys": (Value::from(keys)),
    });

    let mut runcmd = VArray::new();
    if config.workspace_mount {
        // Guest-side mount point exists before the mounts module runs
        runcmd.push(Value::from(VArray::from_iter([
            Value::from("mkdir"),
            Value::from("-p"),
            Value::from(WORKSPACE_GUEST_PATH),
        ])));
    }
    runcmd.push(value!(["systemctl", "enable", "--now", "qemu-guest-agent"]));

    let mut doc = value!({
        "hostname": (Value::from(config.name.as_str())),
        "users": [user],
        "packages": ["qemu-guest-agent"],
        "runcmd": (Value::from(runcmd)),
    });

    if config.workspace_mount {
        let entry = VArray::from_iter([
            Value::from(WORKSPACE_TAG),
            Value::from(WORKSPACE_GUEST_PATH),
            Value::from("9p"),
            Value::from("trans=virtio,version=9p2000.L,nofail"),
            Value::from("0"),
            Value::from("0"),
        ]);
        let mut mounts = VArray::new();
        mounts.push(Value::from(entry));
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("mounts", Value::from(mounts));
        }
    }

    let yaml = facet_yaml::to_string(&doc).expect("valid YAML serialization");
    // Strip the "---\n" document separator; cloud-init expects #cloud-config
    // on the first line and some versions choke on a separator after it.
    let yaml = yaml.strip_prefix("---\n").unwrap_or(&yaml);
    format!("#cloud-config\n{yaml}")
}
