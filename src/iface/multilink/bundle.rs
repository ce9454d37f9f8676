use core::fmt::Write;

use heapless::{String, Vec};

use super::{Bundle, BundleHandle, DYNAMIC_PREFIX, MpError, Multilink};
use crate::config::{DEVICE_NAME_LEN, IFACE_STACK_ENTRY_COUNT};
use crate::iface::device::{
    ControlState, Device, DeviceFlags, EndpointClass, LcpFlags, LinkPhase, Registry,
};
use crate::phy::IfIndex;
use crate::storage::BufferPool;

/// What happened to a bundle when one of its links was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRemoved {
    /// Other links remain in the bundle.
    Detached,
    /// The bundle has no links left and waits for new ones.
    Emptied,
    /// The bundle had been created on demand; it is gone along with its
    /// virtual interface.
    Destroyed,
}

/// What is known about a bundle and the peer at its far end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleInfo<'a> {
    pub virtual_if: IfIndex,
    /// Name the peer authenticated with.
    pub user_name: &'a str,
    pub endpoint_disc: &'a [u8],
    pub endpoint_class: EndpointClass,
    /// Largest frame the peer reassembles.
    pub mrru: u16,
    /// Member links, in interface stack order.
    pub links: Vec<IfIndex, IFACE_STACK_ENTRY_COUNT>,
}

/// Query whether `link` was negotiated with the peer already at the end of `bundle`.
fn same_peer(bundle: &Device, link: &Device) -> bool {
    let (mp, ppp) = (&bundle.link, &link.link);
    mp.login_name.eq_ignore_ascii_case(&ppp.login_name)
        && ppp.remote.endpoint_disc.starts_with(&mp.remote.endpoint_disc)
        && mp.remote.endpoint_class == ppp.remote.endpoint_class
}

impl Multilink {
    /// Create a statically configured virtual interface named `name`, with
    /// an empty bundle attached.
    pub fn init_virtual(
        &mut self,
        registry: &mut Registry,
        name: &str,
    ) -> Result<IfIndex, MpError> {
        let mut device = Device::new(name)?;
        device.flags = DeviceFlags::VIRTUAL | DeviceFlags::POINT_TO_POINT;
        let index = registry.devices.add(device)?;
        if let Err(err) = self.create_bundle(registry, index) {
            registry.devices.remove(index);
            return Err(err);
        }
        net_info!("multilink: virtual interface {} ({}) initialized", name, index);
        Ok(index)
    }

    /// Attach a fresh bundle to the virtual interface `virtual_if`.
    pub fn create_bundle(
        &mut self,
        registry: &mut Registry,
        virtual_if: IfIndex,
    ) -> Result<BundleHandle, MpError> {
        let device = registry
            .devices
            .get_mut(virtual_if)
            .ok_or(MpError::NotPresent)?;
        let slot = self
            .bundles
            .iter()
            .position(Option::is_none)
            .ok_or(MpError::Exhausted)?;
        let handle = BundleHandle(slot);
        self.order.push(handle).map_err(|_| MpError::Exhausted)?;
        self.bundles[slot] = Some(Bundle::new(virtual_if));
        device.bundle = Some(handle);
        device.flags |= DeviceFlags::VIRTUAL;
        net_debug!("multilink: bundle {} created on interface {}", slot, virtual_if);
        Ok(handle)
    }

    fn take_bundle(&mut self, handle: BundleHandle) -> Option<Bundle> {
        self.order.retain(|&h| h != handle);
        self.bundles.get_mut(handle.0)?.take()
    }

    /// Release the fragments a bundle still holds.
    fn flush(pool: &mut BufferPool, bundle: &mut Bundle) {
        for fragment in bundle.fragments.drain(..) {
            pool.free(fragment.buf);
        }
        bundle.e_bits = 0;
        bundle.latest_min_seq = None;
    }

    /// Prepare the PPP link `link` to negotiate Multilink for the bundle on
    /// `virtual_if`: request an MRRU, our endpoint discriminator and, if so
    /// configured, short sequence numbers, and authenticate with the bundle's
    /// login name. The link is recorded under the bundle but carries no
    /// traffic until it is added with [`add_link`](#method.add_link).
    pub fn attach_link(
        &mut self,
        registry: &mut Registry,
        virtual_if: IfIndex,
        link: IfIndex,
    ) -> Result<(), MpError> {
        let login = registry
            .devices
            .get(virtual_if)
            .ok_or(MpError::InvalidLink)?
            .link
            .login_name
            .clone();
        let config = self.config;
        let device = registry.devices.get_mut(link).ok_or(MpError::InvalidLink)?;

        let lcp = &mut device.link;
        lcp.local.flags |= LcpFlags::MRRU | LcpFlags::ENDPOINT_DISC;
        lcp.remote.flags |= LcpFlags::MRRU;
        if config.short_seq_default {
            lcp.local.flags |= LcpFlags::SHORT_SEQ_NUM;
        }
        lcp.local.mrru = config.default_mrru;
        lcp.local.endpoint_disc.clear();
        lcp.local
            .endpoint_disc
            .extend_from_slice(&config.endpoint_mac)
            .map_err(|_| MpError::NoMemory)?;
        lcp.local.endpoint_class = EndpointClass::Mac;
        lcp.login_name = login;

        registry.stack.add_entry(virtual_if, link)?;
        Ok(())
    }

    /// Return the bundle the link `link` is stacked under.
    pub fn find_bundle_by_device(
        &self,
        registry: &Registry,
        link: IfIndex,
    ) -> Option<BundleHandle> {
        let entry = registry.stack.get_higher(link)?;
        let handle = registry.devices.get(entry.higher)?.bundle?;
        self.bundle(handle).map(|_| handle)
    }

    /// Find the bundle the link `link` should join.
    ///
    /// An empty bundle on `virtual_if` takes any link. Otherwise the bundle
    /// must already lead to the same peer: same login name (ignoring case),
    /// endpoint discriminator and class. When `virtual_if` is given, the
    /// bundle found must be the one on it.
    pub fn get_bundle(
        &self,
        registry: &Registry,
        link: IfIndex,
        virtual_if: Option<IfIndex>,
    ) -> Result<BundleHandle, MpError> {
        let mut found = None;
        if let Some(virtual_if) = virtual_if {
            let handle = registry
                .devices
                .get(virtual_if)
                .and_then(|device| device.bundle)
                .ok_or(MpError::InvalidLink)?;
            if self.bundle(handle).is_some_and(|bundle| bundle.num_links == 0) {
                found = Some(handle);
            }
        }

        if found.is_none() {
            let device = registry.devices.get(link).ok_or(MpError::InvalidLink)?;
            found = self
                .bundles()
                .find(|(_, bundle)| {
                    registry
                        .devices
                        .get(bundle.virtual_if)
                        .is_some_and(|mp| same_peer(mp, device))
                })
                .map(|(handle, _)| handle);
        }

        match (virtual_if, found) {
            (Some(virtual_if), Some(handle))
                if self.bundle(handle).map(Bundle::virtual_if) == Some(virtual_if) =>
            {
                Ok(handle)
            }
            (Some(_), _) => Err(MpError::InvalidLink),
            (None, Some(handle)) => Ok(handle),
            (None, None) => Err(MpError::NotPresent),
        }
    }

    /// Create a virtual interface and bundle on demand for `link`.
    fn create_dynamic(
        &mut self,
        registry: &mut Registry,
        link: IfIndex,
    ) -> Result<BundleHandle, MpError> {
        let link_flags = registry.devices.get(link).ok_or(MpError::InvalidLink)?.flags;
        let mut device = Device::new(DYNAMIC_PREFIX)?;
        device.flags =
            DeviceFlags::VIRTUAL | DeviceFlags::POINT_TO_POINT | DeviceFlags::UP | link_flags;
        let index = registry.devices.add(device)?;

        let mut name: String<DEVICE_NAME_LEN> = String::new();
        let renamed = write!(name, "{}{}", DYNAMIC_PREFIX, index).is_ok()
            && registry
                .devices
                .get_mut(index)
                .is_some_and(|device| device.set_name(&name).is_ok());
        if !renamed {
            registry.devices.remove(index);
            return Err(MpError::NoMemory);
        }

        let handle = match self.create_bundle(registry, index) {
            Ok(handle) => handle,
            Err(err) => {
                registry.devices.remove(index);
                return Err(err);
            }
        };
        if let Err(err) = registry.stack.add_entry(index, link) {
            self.take_bundle(handle);
            registry.devices.remove(index);
            return Err(err.into());
        }
        net_info!("multilink: created {} for link {}", name.as_str(), link);
        Ok(handle)
    }

    /// Add the PPP link `link` to a bundle, once LCP has negotiated Multilink.
    ///
    /// With `virtual_if` the link must join the bundle on that interface.
    /// Without it, the link joins the bundle leading to the same peer, or a
    /// new virtual interface is created for it. The first link of a bundle
    /// hands its negotiated options and login to the virtual interface.
    ///
    /// Returns the index of the bundle's virtual interface.
    pub fn add_link(
        &mut self,
        registry: &mut Registry,
        link: IfIndex,
        virtual_if: Option<IfIndex>,
    ) -> Result<IfIndex, MpError> {
        let (link_layer, link_header_len, link_baud_rate) = {
            let device = registry.devices.get(link).ok_or(MpError::InvalidLink)?;
            (device.link.clone(), device.header_len, device.baud_rate)
        };

        if let Some(entry) = registry.stack.get_higher(link).filter(|entry| entry.active) {
            return match virtual_if {
                Some(virtual_if) if virtual_if != entry.higher => Err(MpError::InvalidLink),
                _ => {
                    net_debug!("multilink: link {} already in interface {}", link, entry.higher);
                    Ok(entry.higher)
                }
            };
        }

        let handle = match self.get_bundle(registry, link, virtual_if) {
            Ok(handle) => {
                let mp_if = self.bundle(handle).ok_or(MpError::NotPresent)?.virtual_if;
                if !registry.stack.contains(mp_if, link) {
                    registry.stack.add_entry(mp_if, link)?;
                }
                handle
            }
            Err(MpError::NotPresent) => self.create_dynamic(registry, link)?,
            Err(err) => return Err(err),
        };

        let min_reasm_max_size = self.config.min_reasm_max_size;
        let bundle = self.bundle_mut(handle).ok_or(MpError::NotPresent)?;
        let mp_if = bundle.virtual_if;
        let mp = registry.devices.get_mut(mp_if).ok_or(MpError::NotPresent)?;
        if bundle.num_links == 0 {
            mp.link = link_layer;
            if mp.link.local.mrru as usize > min_reasm_max_size {
                mp.reasm_max_size = mp.link.local.mrru as usize;
            }
        } else {
            mp.mtu = mp.link.remote.mrru as usize;
        }
        mp.header_len = mp.header_len.max(link_header_len);

        registry.stack.activate(mp_if, link)?;
        bundle.num_links += 1;
        bundle.total_baud_rate += link_baud_rate;
        bundle.latest_min_seq = None;
        if let Some(device) = registry.devices.get_mut(link) {
            device.flags |= DeviceFlags::UP;
            device.mp_last_seq = None;
        }
        net_info!(
            "multilink: link {} joined interface {} ({} links)",
            link,
            mp_if,
            bundle.num_links
        );
        Ok(mp_if)
    }

    /// Take the link `link` out of its bundle.
    ///
    /// When the last link leaves, the virtual interface loses its IPv4
    /// address and any fragments still queued are released. A bundle that
    /// was created on demand is then destroyed with its virtual interface;
    /// a statically configured one stays, empty, for later links.
    pub fn remove_link(
        &mut self,
        pool: &mut BufferPool,
        registry: &mut Registry,
        link: IfIndex,
    ) -> Result<(IfIndex, LinkRemoved), MpError> {
        let entry = registry.stack.get_higher(link).ok_or(MpError::NotPresent)?;
        let mp_if = entry.higher;
        let handle = registry
            .devices
            .get(mp_if)
            .and_then(|device| device.bundle)
            .ok_or(MpError::NotPresent)?;
        registry.stack.remove_entry(mp_if, link)?;

        let baud_rate = match registry.devices.get_mut(link) {
            Some(device) => {
                device.mp_last_seq = None;
                device.baud_rate
            }
            None => 0,
        };

        let bundle = self.bundle_mut(handle).ok_or(MpError::NotPresent)?;
        if !entry.active {
            return Ok((mp_if, LinkRemoved::Detached));
        }
        bundle.num_links = bundle.num_links.saturating_sub(1);
        bundle.total_baud_rate = bundle.total_baud_rate.saturating_sub(baud_rate);
        net_info!("multilink: link {} left interface {}", link, mp_if);
        if bundle.num_links > 0 {
            return Ok((mp_if, LinkRemoved::Detached));
        }

        Self::flush(pool, bundle);
        let mp = registry.devices.get_mut(mp_if).ok_or(MpError::NotPresent)?;
        mp.ipv4_addr = None;
        mp.link.phase = LinkPhase::Initial;
        mp.link.ipcp = ControlState::Closed;
        mp.link.ipv6cp = ControlState::Closed;
        if !mp.name().starts_with(DYNAMIC_PREFIX) {
            return Ok((mp_if, LinkRemoved::Emptied));
        }

        self.take_bundle(handle);
        while let Some(entry) = registry.stack.get_lower(mp_if) {
            registry.stack.remove_entry(entry.higher, entry.lower)?;
        }
        registry.devices.remove(mp_if);
        net_debug!("multilink: interface {} destroyed", mp_if);
        Ok((mp_if, LinkRemoved::Destroyed))
    }

    /// Return the virtual interface the link named `link_name` belongs to.
    pub fn virt_if_by_device(
        &self,
        registry: &Registry,
        link_name: &str,
    ) -> Result<IfIndex, MpError> {
        let device = registry.devices.by_name(link_name).ok_or(MpError::NotPresent)?;
        registry
            .stack
            .get_higher(device.index())
            .map(|entry| entry.higher)
            .ok_or(MpError::NotPresent)
    }

    /// Return the virtual interface of the bundle whose peer logged in as
    /// `user_name`, ignoring case.
    pub fn virt_if_by_user(
        &self,
        registry: &Registry,
        user_name: &str,
    ) -> Result<IfIndex, MpError> {
        self.bundles()
            .map(|(_, bundle)| bundle.virtual_if)
            .find(|&mp_if| {
                registry
                    .devices
                    .get(mp_if)
                    .is_some_and(|device| device.link.login_name.eq_ignore_ascii_case(user_name))
            })
            .ok_or(MpError::NotPresent)
    }

    pub fn bundle_info<'r>(
        &self,
        registry: &'r Registry,
        virtual_if: IfIndex,
    ) -> Result<BundleInfo<'r>, MpError> {
        let device = registry.devices.get(virtual_if).ok_or(MpError::NotPresent)?;
        let handle = device.bundle.ok_or(MpError::NotPresent)?;
        self.bundle(handle).ok_or(MpError::NotPresent)?;

        let mut links = Vec::new();
        for lower in registry.stack.lowers(virtual_if) {
            if links.push(lower).is_err() {
                break;
            }
        }
        Ok(BundleInfo {
            virtual_if,
            user_name: &device.link.login_name,
            endpoint_disc: &device.link.remote.endpoint_disc,
            endpoint_class: device.link.remote.endpoint_class,
            mrru: device.link.remote.mrru,
            links,
        })
    }

    /// Return the virtual interface of the bundle created after the one on
    /// `virtual_if`, wrapping around to the first.
    pub fn next_interface(&self, virtual_if: IfIndex) -> Result<IfIndex, MpError> {
        let interfaces = || self.bundles().map(|(_, bundle)| bundle.virtual_if);
        let position = interfaces()
            .position(|mp_if| mp_if == virtual_if)
            .ok_or(MpError::NotPresent)?;
        interfaces()
            .nth(position + 1)
            .or_else(|| interfaces().next())
            .ok_or(MpError::NotPresent)
    }

    /// Query whether `index` is the virtual interface of a bundle.
    pub fn is_bundle_interface(&self, registry: &Registry, index: IfIndex) -> bool {
        registry
            .devices
            .get(index)
            .and_then(|device| device.bundle)
            .is_some_and(|handle| self.bundle(handle).is_some())
    }

    /// Remove every link from the bundle on `virtual_if`, returning the links
    /// so that they can be hung up.
    pub fn terminate_links(
        &mut self,
        pool: &mut BufferPool,
        registry: &mut Registry,
        virtual_if: IfIndex,
    ) -> Result<Vec<IfIndex, IFACE_STACK_ENTRY_COUNT>, MpError> {
        if !self.is_bundle_interface(registry, virtual_if) {
            return Err(MpError::NotPresent);
        }
        let mut links = Vec::new();
        while let Some(entry) = registry.stack.get_lower(virtual_if) {
            let (_, removed) = self.remove_link(pool, registry, entry.lower)?;
            if links.push(entry.lower).is_err() {
                net_error!("multilink: too many links on interface {}", virtual_if);
                break;
            }
            if removed == LinkRemoved::Destroyed {
                break;
            }
        }
        Ok(links)
    }
}
