//! The virtual devices a VM can be built with.
//!
//! [Device] is a closed set. Backends consume a device list through a [DeviceApplier], which has one handler per
//! variant, so adding a variant forces every applier to handle it. The crate's own applier,
//! [MachineConfigurationBuilder], sorts devices into typed arrays and produces a hypervisor-neutral
//! [MachineConfiguration].

use std::{
    collections::HashSet,
    path::PathBuf,
    time::Duration,
};

use crate::{
    bootloader::Bootloader,
    error::{Classify, ErrorKind},
    network::{MacAddress, NetworkError, socketpair::GuestNetEndpoint, validate_datagram_path},
};

const MAX_DEVICE_ID_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtioBlk {
    pub image_path: PathBuf,
    pub read_only: bool,
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtioFs {
    pub host_path: PathBuf,
    pub tag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VsockDirection {
    /// The guest listens on the port and the host dials in.
    GuestListens,
    /// The guest dials out to the port and the host accepts.
    GuestConnects,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtioVsock {
    pub port: u32,
    pub direction: VsockDirection,
    pub socket_path: Option<PathBuf>,
}

/// What carries a virtio-net device's frames on the host side.
#[derive(Debug)]
pub enum NetBacking {
    /// The hypervisor's built-in NAT.
    Nat,
    /// One end of a datagram socket pair, handed over by ownership.
    DatagramSocket(GuestNetEndpoint),
    /// A unix datagram socket bound at a path.
    UnixDatagramPath(PathBuf),
}

#[derive(Debug)]
pub struct VirtioNet {
    pub mac: MacAddress,
    pub backing: NetBacking,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialSink {
    Stdio,
    File(PathBuf),
    Pty,
    Fifo(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtioSerial {
    pub sink: SerialSink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtioGpu {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Pointing,
    Keyboard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtioInput {
    pub kind: InputKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvmeController {
    pub image_path: PathBuf,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkBlockDevice {
    pub uri: String,
    pub read_only: bool,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbMassStorage {
    pub image_path: PathBuf,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosettaShare {
    pub tag: String,
}

#[derive(Debug)]
pub enum Device {
    VirtioBlk(VirtioBlk),
    VirtioFs(VirtioFs),
    VirtioVsock(VirtioVsock),
    VirtioNet(VirtioNet),
    VirtioRng,
    VirtioSerial(VirtioSerial),
    VirtioBalloon,
    VirtioGpu(VirtioGpu),
    VirtioInput(VirtioInput),
    NvmeController(NvmeController),
    NetworkBlockDevice(NetworkBlockDevice),
    UsbMassStorage(UsbMassStorage),
    RosettaShare(RosettaShare),
}

impl Device {
    pub fn virtio_fs(host_path: impl Into<PathBuf>, tag: impl Into<String>) -> Self {
        Device::VirtioFs(VirtioFs {
            host_path: host_path.into(),
            tag: tag.into(),
        })
    }

    pub fn virtio_blk(image_path: impl Into<PathBuf>, read_only: bool) -> Self {
        Device::VirtioBlk(VirtioBlk {
            image_path: image_path.into(),
            read_only,
            device_id: None,
        })
    }

    pub fn vsock(port: u32, direction: VsockDirection) -> Self {
        Device::VirtioVsock(VirtioVsock {
            port,
            direction,
            socket_path: None,
        })
    }

    pub fn serial(sink: SerialSink) -> Self {
        Device::VirtioSerial(VirtioSerial { sink })
    }

    pub fn net(mac: MacAddress, backing: NetBacking) -> Self {
        Device::VirtioNet(VirtioNet { mac, backing })
    }

    /// Hand this device to the applier's handler for its variant.
    pub fn apply<A: DeviceApplier + ?Sized>(self, applier: &mut A) -> Result<(), A::Error> {
        match self {
            Device::VirtioBlk(dev) => applier.apply_virtio_blk(dev),
            Device::VirtioFs(dev) => applier.apply_virtio_fs(dev),
            Device::VirtioVsock(dev) => applier.apply_virtio_vsock(dev),
            Device::VirtioNet(dev) => applier.apply_virtio_net(dev),
            Device::VirtioRng => applier.apply_virtio_rng(),
            Device::VirtioSerial(dev) => applier.apply_virtio_serial(dev),
            Device::VirtioBalloon => applier.apply_virtio_balloon(),
            Device::VirtioGpu(dev) => applier.apply_virtio_gpu(dev),
            Device::VirtioInput(dev) => applier.apply_virtio_input(dev),
            Device::NvmeController(dev) => applier.apply_nvme_controller(dev),
            Device::NetworkBlockDevice(dev) => applier.apply_network_block_device(dev),
            Device::UsbMassStorage(dev) => applier.apply_usb_mass_storage(dev),
            Device::RosettaShare(dev) => applier.apply_rosetta_share(dev),
        }
    }
}

/// A visitor with one handler per [Device] variant.
pub trait DeviceApplier {
    type Error;

    fn apply_virtio_blk(&mut self, dev: VirtioBlk) -> Result<(), Self::Error>;
    fn apply_virtio_fs(&mut self, dev: VirtioFs) -> Result<(), Self::Error>;
    fn apply_virtio_vsock(&mut self, dev: VirtioVsock) -> Result<(), Self::Error>;
    fn apply_virtio_net(&mut self, dev: VirtioNet) -> Result<(), Self::Error>;
    fn apply_virtio_rng(&mut self) -> Result<(), Self::Error>;
    fn apply_virtio_serial(&mut self, dev: VirtioSerial) -> Result<(), Self::Error>;
    fn apply_virtio_balloon(&mut self) -> Result<(), Self::Error>;
    fn apply_virtio_gpu(&mut self, dev: VirtioGpu) -> Result<(), Self::Error>;
    fn apply_virtio_input(&mut self, dev: VirtioInput) -> Result<(), Self::Error>;
    fn apply_nvme_controller(&mut self, dev: NvmeController) -> Result<(), Self::Error>;
    fn apply_network_block_device(&mut self, dev: NetworkBlockDevice) -> Result<(), Self::Error>;
    fn apply_usb_mass_storage(&mut self, dev: UsbMassStorage) -> Result<(), Self::Error>;
    fn apply_rosetta_share(&mut self, dev: RosettaShare) -> Result<(), Self::Error>;
}

#[derive(Debug)]
pub enum DeviceError {
    TagCollision(String),
    EmptyTag,
    InvalidDeviceId(String),
    VsockPortConflict(u32),
    NetworkError(NetworkError),
}

impl std::error::Error for DeviceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeviceError::NetworkError(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::TagCollision(tag) => write!(f, "The shared filesystem tag \"{tag}\" is used more than once"),
            DeviceError::EmptyTag => write!(f, "A shared filesystem tag is empty"),
            DeviceError::InvalidDeviceId(id) => write!(
                f,
                "The storage device ID \"{id}\" must be non-empty, contain no '/' and be at most 255 bytes long"
            ),
            DeviceError::VsockPortConflict(port) => {
                write!(f, "The vsock port {port} was requested with conflicting settings")
            }
            DeviceError::NetworkError(err) => write!(f, "A network device is invalid: {err}"),
        }
    }
}

impl Classify for DeviceError {
    fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::NetworkError(err) => err.kind(),
            _ => ErrorKind::ConfigInvalid,
        }
    }
}

#[derive(Debug)]
pub enum StorageDevice {
    VirtioBlk(VirtioBlk),
    Nvme(NvmeController),
    NetworkBlockDevice(NetworkBlockDevice),
    UsbMassStorage(UsbMassStorage),
}

#[derive(Debug)]
pub enum DirectoryShare {
    VirtioFs(VirtioFs),
    Rosetta(RosettaShare),
}

impl DirectoryShare {
    pub fn tag(&self) -> &str {
        match self {
            DirectoryShare::VirtioFs(dev) => &dev.tag,
            DirectoryShare::Rosetta(dev) => &dev.tag,
        }
    }
}

/// A port mapping on the single vsock device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsockPort {
    pub port: u32,
    pub direction: VsockDirection,
    pub socket_path: Option<PathBuf>,
}

/// The one vsock device every VM carries, with all requested port mappings merged into it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VsockDevice {
    pub ports: Vec<VsockPort>,
}

/// The one memory balloon device every VM carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalloonDevice;

/// A hypervisor-neutral, validated description of a VM.
#[derive(Debug)]
pub struct MachineConfiguration {
    pub vcpus: u32,
    pub memory_bytes: u64,
    pub bootloader: Bootloader,
    pub storage: Vec<StorageDevice>,
    pub directory_sharing: Vec<DirectoryShare>,
    pub network: Vec<VirtioNet>,
    pub serial: Vec<VirtioSerial>,
    pub entropy: usize,
    pub input: Vec<VirtioInput>,
    pub graphics: Vec<VirtioGpu>,
    pub console_ports: Vec<VirtioSerial>,
    pub vsock: VsockDevice,
    pub balloon: BalloonDevice,
}

/// The crate's [DeviceApplier]: accumulates devices by category and validates them as they arrive.
#[derive(Debug)]
pub struct MachineConfigurationBuilder {
    vcpus: u32,
    memory_bytes: u64,
    bootloader: Bootloader,
    storage: Vec<StorageDevice>,
    directory_sharing: Vec<DirectoryShare>,
    network: Vec<VirtioNet>,
    serial: Vec<VirtioSerial>,
    entropy: usize,
    input: Vec<VirtioInput>,
    graphics: Vec<VirtioGpu>,
    console_ports: Vec<VirtioSerial>,
    vsock_ports: Vec<VsockPort>,
    tags: HashSet<String>,
}

impl MachineConfigurationBuilder {
    pub fn new(vcpus: u32, memory_bytes: u64, bootloader: Bootloader) -> Self {
        Self {
            vcpus,
            memory_bytes,
            bootloader,
            storage: Vec::new(),
            directory_sharing: Vec::new(),
            network: Vec::new(),
            serial: Vec::new(),
            entropy: 0,
            input: Vec::new(),
            graphics: Vec::new(),
            console_ports: Vec::new(),
            vsock_ports: Vec::new(),
            tags: HashSet::new(),
        }
    }

    /// Apply devices in order, stopping at the first invalid one.
    pub fn apply_all(mut self, devices: impl IntoIterator<Item = Device>) -> Result<Self, DeviceError> {
        for device in devices {
            device.apply(&mut self)?;
        }
        Ok(self)
    }

    /// Produce the final configuration. The vsock and balloon devices are always present exactly once, however
    /// many times (including zero) they were requested.
    pub fn finalize(self) -> MachineConfiguration {
        MachineConfiguration {
            vcpus: self.vcpus,
            memory_bytes: self.memory_bytes,
            bootloader: self.bootloader,
            storage: self.storage,
            directory_sharing: self.directory_sharing,
            network: self.network,
            serial: self.serial,
            entropy: self.entropy,
            input: self.input,
            graphics: self.graphics,
            console_ports: self.console_ports,
            vsock: VsockDevice {
                ports: self.vsock_ports,
            },
            balloon: BalloonDevice,
        }
    }

    fn claim_tag(&mut self, tag: &str) -> Result<(), DeviceError> {
        if tag.is_empty() {
            return Err(DeviceError::EmptyTag);
        }
        if !self.tags.insert(tag.to_owned()) {
            return Err(DeviceError::TagCollision(tag.to_owned()));
        }
        Ok(())
    }
}

fn validate_device_id(id: &str) -> Result<(), DeviceError> {
    if id.is_empty() || id.contains('/') || id.len() > MAX_DEVICE_ID_LEN {
        return Err(DeviceError::InvalidDeviceId(id.to_owned()));
    }
    Ok(())
}

impl DeviceApplier for MachineConfigurationBuilder {
    type Error = DeviceError;

    fn apply_virtio_blk(&mut self, dev: VirtioBlk) -> Result<(), DeviceError> {
        if let Some(ref id) = dev.device_id {
            validate_device_id(id)?;
        }
        self.storage.push(StorageDevice::VirtioBlk(dev));
        Ok(())
    }

    fn apply_virtio_fs(&mut self, dev: VirtioFs) -> Result<(), DeviceError> {
        self.claim_tag(&dev.tag)?;
        self.directory_sharing.push(DirectoryShare::VirtioFs(dev));
        Ok(())
    }

    fn apply_virtio_vsock(&mut self, dev: VirtioVsock) -> Result<(), DeviceError> {
        let port = VsockPort {
            port: dev.port,
            direction: dev.direction,
            socket_path: dev.socket_path,
        };
        match self.vsock_ports.iter().find(|existing| existing.port == port.port) {
            Some(existing) if *existing != port => Err(DeviceError::VsockPortConflict(port.port)),
            Some(_) => Ok(()),
            None => {
                self.vsock_ports.push(port);
                Ok(())
            }
        }
    }

    fn apply_virtio_net(&mut self, dev: VirtioNet) -> Result<(), DeviceError> {
        if let NetBacking::UnixDatagramPath(ref path) = dev.backing {
            validate_datagram_path(path).map_err(DeviceError::NetworkError)?;
        }
        self.network.push(dev);
        Ok(())
    }

    fn apply_virtio_rng(&mut self) -> Result<(), DeviceError> {
        self.entropy += 1;
        Ok(())
    }

    fn apply_virtio_serial(&mut self, dev: VirtioSerial) -> Result<(), DeviceError> {
        match dev.sink {
            SerialSink::Stdio | SerialSink::File(_) => self.serial.push(dev),
            SerialSink::Pty | SerialSink::Fifo(_) => self.console_ports.push(dev),
        }
        Ok(())
    }

    fn apply_virtio_balloon(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn apply_virtio_gpu(&mut self, dev: VirtioGpu) -> Result<(), DeviceError> {
        self.graphics.push(dev);
        Ok(())
    }

    fn apply_virtio_input(&mut self, dev: VirtioInput) -> Result<(), DeviceError> {
        self.input.push(dev);
        Ok(())
    }

    fn apply_nvme_controller(&mut self, dev: NvmeController) -> Result<(), DeviceError> {
        self.storage.push(StorageDevice::Nvme(dev));
        Ok(())
    }

    fn apply_network_block_device(&mut self, dev: NetworkBlockDevice) -> Result<(), DeviceError> {
        self.storage.push(StorageDevice::NetworkBlockDevice(dev));
        Ok(())
    }

    fn apply_usb_mass_storage(&mut self, dev: UsbMassStorage) -> Result<(), DeviceError> {
        self.storage.push(StorageDevice::UsbMassStorage(dev));
        Ok(())
    }

    fn apply_rosetta_share(&mut self, dev: RosettaShare) -> Result<(), DeviceError> {
        self.claim_tag(&dev.tag)?;
        self.directory_sharing.push(DirectoryShare::Rosetta(dev));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use assert_matches::assert_matches;
    use proptest::prelude::*;

    use super::{
        Device, DeviceError, MachineConfigurationBuilder, NetBacking, SerialSink, StorageDevice, VirtioBlk,
        VsockDirection,
    };
    use crate::{
        bootloader::Bootloader,
        network::{GUEST_MAC, NetworkError},
    };

    fn builder() -> MachineConfigurationBuilder {
        MachineConfigurationBuilder::new(
            2,
            1 << 30,
            Bootloader::Linux {
                kernel_path: PathBuf::from("/vmlinux"),
                initrd_path: None,
                cmdline: "console=hvc0".into(),
            },
        )
    }

    #[test]
    fn shared_fs_tags_must_be_unique() {
        let result = builder().apply_all([Device::virtio_fs("/a", "rootfs"), Device::virtio_fs("/b", "rootfs")]);
        assert_matches!(result, Err(DeviceError::TagCollision(tag)) if tag == "rootfs");
    }

    #[test]
    fn storage_ids_are_validated() {
        for id in [String::new(), "a/b".to_owned(), "x".repeat(256)] {
            let device = Device::VirtioBlk(VirtioBlk {
                image_path: PathBuf::from("/disk.img"),
                read_only: false,
                device_id: Some(id),
            });
            assert_matches!(builder().apply_all([device]), Err(DeviceError::InvalidDeviceId(_)));
        }

        let device = Device::VirtioBlk(VirtioBlk {
            image_path: PathBuf::from("/disk.img"),
            read_only: false,
            device_id: Some("x".repeat(255)),
        });
        builder().apply_all([device]).unwrap();
    }

    #[test]
    fn long_datagram_paths_are_rejected() {
        let path = PathBuf::from(format!("/{}", "p".repeat(103)));
        let device = Device::net(GUEST_MAC, NetBacking::UnixDatagramPath(path));
        assert_matches!(
            builder().apply_all([device]),
            Err(DeviceError::NetworkError(NetworkError::DatagramPathTooLong(_)))
        );
    }

    #[test]
    fn serial_sinks_are_sorted() {
        let config = builder()
            .apply_all([
                Device::serial(SerialSink::File(PathBuf::from("/console.log"))),
                Device::serial(SerialSink::Pty),
            ])
            .unwrap()
            .finalize();
        assert_eq!(config.serial.len(), 1);
        assert_eq!(config.console_ports.len(), 1);
    }

    #[test]
    fn conflicting_vsock_ports_are_rejected() {
        let result = builder().apply_all([
            Device::vsock(2019, VsockDirection::GuestListens),
            Device::vsock(2019, VsockDirection::GuestConnects),
        ]);
        assert_matches!(result, Err(DeviceError::VsockPortConflict(2019)));
    }

    #[test]
    fn vsock_ports_keep_insertion_order() {
        let config = builder()
            .apply_all([
                Device::vsock(2019, VsockDirection::GuestListens),
                Device::vsock(1024, VsockDirection::GuestConnects),
                Device::vsock(2019, VsockDirection::GuestListens),
                Device::vsock(7, VsockDirection::GuestListens),
            ])
            .unwrap()
            .finalize();
        let ports = config.vsock.ports.iter().map(|port| port.port).collect::<Vec<_>>();
        assert_eq!(ports, [2019, 1024, 7]);
    }

    fn arb_device() -> impl Strategy<Value = Device> {
        prop_oneof![
            (0u32..4).prop_map(|port| Device::vsock(port, VsockDirection::GuestListens)),
            Just(Device::VirtioBalloon),
            Just(Device::VirtioRng),
            (0u8..8).prop_map(|n| Device::virtio_blk(format!("/disk-{n}.img"), n % 2 == 0)),
        ]
    }

    proptest! {
        #[test]
        fn finalized_configuration_has_one_vsock_and_one_balloon(devices in proptest::collection::vec(arb_device(), 0..32)) {
            let mut requested_ports = Vec::new();
            let mut requested_disks = Vec::new();
            for device in &devices {
                match device {
                    Device::VirtioVsock(dev) if !requested_ports.contains(&dev.port) => requested_ports.push(dev.port),
                    Device::VirtioBlk(dev) => requested_disks.push(dev.image_path.clone()),
                    _ => {}
                }
            }

            let config = builder().apply_all(devices).unwrap().finalize();
            let ports = config.vsock.ports.iter().map(|port| port.port).collect::<Vec<_>>();
            prop_assert_eq!(ports, requested_ports);

            let disks = config
                .storage
                .iter()
                .map(|storage| match storage {
                    StorageDevice::VirtioBlk(dev) => dev.image_path.clone(),
                    _ => unreachable!(),
                })
                .collect::<Vec<_>>();
            prop_assert_eq!(disks, requested_disks);
        }
    }
}
