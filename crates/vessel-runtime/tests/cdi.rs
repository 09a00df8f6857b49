use std::path::PathBuf;
use vessel_runtime::cdi::{CdiError, Registry};
use vessel_schema::{BundleSpec, LinuxDevice, Mount};

const KMSG: &str = "vesseltesting.example.org/device=kmsgDevice";
const TMP17: &str = "vesseltesting.example.org/device=tmpmountDevice17";
const TMP1: &str = "vesseltesting.example.org/tmpmount=tmpmountDevice1";

fn fixture_registry() -> Registry {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/cdi");
    Registry::new(&[dir])
}

fn base_spec() -> BundleSpec {
    let mut spec = BundleSpec::default();
    spec.process_mut().set_env("PATH", "/usr/bin:/bin");
    spec
}

fn names(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}

fn tmp_mount(destination: &str, options: &[&str]) -> Mount {
    Mount {
        destination: destination.to_owned(),
        mount_type: None,
        source: Some("/tmp".to_owned()),
        options: names(options),
    }
}

fn kmsg_device() -> LinuxDevice {
    LinuxDevice {
        path: "/dev/kmsg".to_owned(),
        device_type: "c".to_owned(),
        major: 1,
        minor: 11,
        file_mode: None,
        uid: Some(1000),
        gid: Some(1000),
    }
}

fn env_of(spec: &BundleSpec) -> Vec<String> {
    spec.process.as_ref().map(|p| p.env.clone()).unwrap_or_default()
}

fn assert_env_contains(spec: &BundleSpec, wanted: &[&str]) {
    let env = env_of(spec);
    for w in wanted {
        assert!(env.contains(&(*w).to_owned()), "missing {w} in {env:?}");
    }
}

#[test]
fn fixtures_load_and_broken_spec_is_reported() {
    let reg = fixture_registry();
    assert_eq!(reg.device_names(), names(&[KMSG, TMP17, TMP1]));
    assert_eq!(reg.errors().len(), 1);
    assert!(matches!(reg.errors()[0], CdiError::InvalidSpec { .. }));
}

#[test]
fn single_kmsg_device() {
    let out = fixture_registry()
        .inject_devices(&base_spec(), &names(&[KMSG]))
        .unwrap();

    let linux = out.linux.as_ref().unwrap();
    assert_eq!(linux.devices, vec![kmsg_device()]);
    let rules = &linux.resources.as_ref().unwrap().devices;
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].device_type.as_deref(), Some("c"));
    assert_eq!((rules[0].major, rules[0].minor), (Some(1), Some(11)));
    assert_eq!(rules[0].access.as_deref(), Some("rwm"));

    assert_eq!(out.mounts, vec![tmp_mount("/tmpmountforkmsg", &["rw"])]);
    assert_env_contains(&out, &["FOO=VALID_SPEC", "BAR=BARVALUE1", "PATH=/usr/bin:/bin"]);
}

#[test]
fn tmp_devices_from_two_specs() {
    let out = fixture_registry()
        .inject_devices(&base_spec(), &names(&[TMP17, TMP1]))
        .unwrap();

    assert!(out.linux.is_none());
    assert_eq!(
        out.mounts,
        vec![
            tmp_mount("/tmpmount1", &["ro"]),
            tmp_mount("/tmpmount13", &["rw"]),
            tmp_mount("/tmpmount17", &["r"]),
            tmp_mount("/tmpmount3", &["rbind", "nosuid", "nodev"]),
        ]
    );
    assert_env_contains(
        &out,
        &[
            "ABCD=QWERTY",
            "EFGH=ASDFGH",
            "IJKL=ZXCVBN",
            "FOO=VALID_SPEC",
            "BAR=BARVALUE1",
        ],
    );
}

#[test]
fn tmp_device_from_one_spec() {
    let out = fixture_registry()
        .inject_devices(&base_spec(), &names(&[TMP1]))
        .unwrap();
    assert_eq!(out.mounts.len(), 3);
    assert_env_contains(&out, &["ABCD=QWERTY", "EFGH=ASDFGH", "IJKL=ZXCVBN"]);
    assert!(!env_of(&out).iter().any(|e| e.starts_with("FOO=")));
}

#[test]
fn mixed_devices() {
    let out = fixture_registry()
        .inject_devices(&base_spec(), &names(&[TMP17, KMSG, TMP1]))
        .unwrap();
    assert_eq!(out.linux.as_ref().unwrap().devices, vec![kmsg_device()]);
    let destinations: Vec<&str> = out.mounts.iter().map(|m| m.destination.as_str()).collect();
    assert_eq!(
        destinations,
        [
            "/tmpmount1",
            "/tmpmount13",
            "/tmpmount17",
            "/tmpmount3",
            "/tmpmountforkmsg"
        ]
    );
    let env = env_of(&out);
    assert_eq!(env.iter().filter(|e| e.starts_with("FOO=")).count(), 1);
}

#[test]
fn repeated_injection_is_identical() {
    let requested = names(&[TMP17, KMSG, TMP1]);
    let first = fixture_registry()
        .inject_devices(&base_spec(), &requested)
        .unwrap();
    let second = fixture_registry()
        .inject_devices(&base_spec(), &requested)
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
    let destinations: Vec<&str> = first.mounts.iter().map(|m| m.destination.as_str()).collect();
    let mut sorted = destinations.clone();
    sorted.sort_unstable();
    assert_eq!(destinations, sorted);
}

#[test]
fn existing_mounts_are_sorted_with_injected_ones() {
    let mut spec = base_spec();
    spec.mounts.push(Mount::tmpfs("/zzz", &[]));
    spec.mounts.push(Mount::tmpfs("/dev", &[]));
    let out = fixture_registry()
        .inject_devices(&spec, &names(&[TMP17]))
        .unwrap();
    let destinations: Vec<&str> = out.mounts.iter().map(|m| m.destination.as_str()).collect();
    assert_eq!(destinations, ["/dev", "/tmpmount17", "/zzz"]);
}

#[test]
fn unknown_device_fails_without_mutation() {
    let spec = base_spec();
    let err = fixture_registry()
        .inject_devices(&spec, &names(&["vesseltesting.example.org/device=noSuchDevice"]))
        .unwrap_err();
    assert!(matches!(err, CdiError::UnresolvableDevices(ref n) if n.len() == 1));
    assert_eq!(spec, base_spec());
}

#[test]
fn all_unknown_devices_are_reported_together() {
    let err = fixture_registry()
        .inject_devices(
            &base_spec(),
            &names(&[
                TMP17,
                "vesseltesting.example.org/device=noSuchDevice",
                TMP1,
                "vesseltesting.example.org/device=noSuchDeviceEither",
                KMSG,
            ]),
        )
        .unwrap_err();
    match err {
        CdiError::UnresolvableDevices(missing) => {
            assert_eq!(
                missing,
                names(&[
                    "vesseltesting.example.org/device=noSuchDevice",
                    "vesseltesting.example.org/device=noSuchDeviceEither",
                ])
            );
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn injected_device_replaces_node_with_same_path() {
    let mut spec = base_spec();
    spec.linux_mut().devices.push(LinuxDevice {
        path: "/dev/kmsg".to_owned(),
        device_type: "c".to_owned(),
        major: 9,
        minor: 9,
        file_mode: None,
        uid: None,
        gid: None,
    });
    let out = fixture_registry()
        .inject_devices(&spec, &names(&[KMSG]))
        .unwrap();
    assert_eq!(out.linux.unwrap().devices, vec![kmsg_device()]);
}
