// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use kmt_api::*;
use kmt_sim::{Call, SimConfig, SimDriver, SimHost, SimLoader};

fn loaded() -> (SimLoader, Callbacks) {
    let loader = SimLoader::new(SimDriver::new(SimConfig::default()));
    let mut cb = Callbacks::new();
    cb.init(&loader, DEFAULT_DRIVER_MODULE).unwrap();
    (loader, cb)
}

#[test]
fn init_requests_module_by_name() {
    let (loader, cb) = loaded();
    assert!(cb.is_initialized());
    assert_eq!(loader.load_requests(), vec!["gdi32.dll".to_string()]);
    assert_eq!(loader.live_modules(), 1);
}

#[test]
fn init_twice_is_noop() {
    let (loader, mut cb) = loaded();
    cb.init(&loader, DEFAULT_DRIVER_MODULE).unwrap();
    assert_eq!(loader.load_requests().len(), 1);
    assert_eq!(loader.live_modules(), 1);
}

#[test]
fn init_from_other_module_refused() {
    let (loader, mut cb) = loaded();
    // module names compare case-insensitively
    cb.init(&loader, "GDI32.DLL").unwrap();
    match cb.init(&loader, "vboxgdi.dll") {
        Err(Error::NotAvailable(msg)) => {
            assert!(msg.contains("gdi32.dll"), "{msg}")
        }
        other => panic!("unexpected init result {other:?}"),
    }
    // the first module's thunks stay in use
    assert!(cb.is_initialized());
    assert_eq!(loader.load_requests(), vec!["gdi32.dll".to_string()]);
    assert_eq!(loader.live_modules(), 1);
}

#[test]
fn missing_module() {
    let loader =
        SimLoader::new(SimDriver::new(SimConfig::default())).unavailable();
    let mut cb = Callbacks::new();
    assert!(matches!(
        cb.init(&loader, DEFAULT_DRIVER_MODULE),
        Err(Error::NotAvailable(_))
    ));
    assert!(!cb.is_initialized());
}

#[test]
fn missing_entry_point_is_atomic() {
    let loader = SimLoader::new(SimDriver::new(SimConfig::default()))
        .without_entry(EntryPoint::Unlock);
    let mut cb = Callbacks::new();
    match cb.init(&loader, DEFAULT_DRIVER_MODULE) {
        Err(Error::MissingEntryPoint(name)) => assert_eq!(name, "D3DKMTUnlock"),
        other => panic!("unexpected init result {other:?}"),
    }
    assert!(!cb.is_initialized());
    // the module was released again
    assert_eq!(loader.live_modules(), 0);

    let host = SimHost::new();
    assert!(matches!(cb.open_adapter(&host), Err(Error::NotAvailable(_))));
    assert!(loader.driver().calls().is_empty());

    cb.term();
    assert!(!cb.is_initialized());
}

#[test]
fn term_releases_module() {
    let (loader, mut cb) = loaded();
    cb.term();
    assert_eq!(loader.live_modules(), 0);
    cb.term();
    assert!(matches!(cb.thunks(), Err(Error::NotAvailable(_))));
}

#[test]
fn primary_display_selected() {
    let (loader, cb) = loaded();
    let host = SimHost::with_displays(vec![
        DisplayDevice { name: "\\\\.\\DISPLAY1".to_string(), primary: false },
        DisplayDevice { name: "\\\\.\\DISPLAY2".to_string(), primary: true },
    ]);

    let adapter = cb.open_adapter(&host).unwrap();
    assert!(adapter.hdc.is_some());
    assert_eq!(host.dcs_created(), 1);
    assert_eq!(
        loader.driver().calls(),
        vec![Call::OpenAdapterFromHdc { hdc: adapter.hdc.unwrap() }]
    );

    cb.close_adapter(&host, &adapter).unwrap();
    assert_eq!(host.live_dcs(), 0);
    assert_eq!(loader.driver().live_objects(), 0);
}

#[test]
fn no_primary_display() {
    let (loader, cb) = loaded();
    let host = SimHost::with_displays(vec![DisplayDevice {
        name: "\\\\.\\DISPLAY1".to_string(),
        primary: false,
    }]);
    assert!(matches!(cb.open_adapter(&host), Err(Error::NoPrimaryDisplay)));
    assert_eq!(host.dcs_created(), 0);
    assert!(loader.driver().calls().is_empty());
}

#[test]
fn open_failure_releases_dc() {
    let (loader, cb) = loaded();
    let host = SimHost::new();
    loader
        .driver()
        .fail_next(EntryPoint::OpenAdapterFromHdc, STATUS_UNSUCCESSFUL);

    assert!(matches!(
        cb.open_adapter(&host),
        Err(Error::Driver { op: "D3DKMTOpenAdapterFromHdc", .. })
    ));
    assert_eq!(host.dcs_created(), 1);
    assert_eq!(host.live_dcs(), 0);
}

#[test]
fn close_failure_still_releases_dc() {
    let (loader, cb) = loaded();
    let host = SimHost::new();
    let adapter = cb.open_adapter(&host).unwrap();

    loader.driver().fail_next(EntryPoint::CloseAdapter, STATUS_DEVICE_REMOVED);
    assert!(matches!(
        cb.close_adapter(&host, &adapter),
        Err(Error::DeviceLost { .. })
    ));
    assert_eq!(host.live_dcs(), 0);
}

#[test]
fn open_by_display_name() {
    let (loader, cb) = loaded();
    let adapter = cb.open_adapter_from_display_name("\\\\.\\DISPLAY3").unwrap();
    assert_eq!(adapter.hdc, None);
    assert_eq!(
        loader.driver().calls(),
        vec![Call::OpenAdapterFromGdiDisplayName {
            name: "\\\\.\\DISPLAY3".to_string()
        }]
    );

    let long = "x".repeat(GDI_DISPLAY_NAME_LEN);
    assert!(matches!(
        cb.open_adapter_from_display_name(&long),
        Err(Error::InvalidArgument(_))
    ));
    // rejected before reaching the driver
    assert_eq!(
        loader.driver().call_count(EntryPoint::OpenAdapterFromGdiDisplayName),
        1
    );
}

#[test]
fn device_and_context_chain() {
    let (loader, cb) = loaded();
    let host = SimHost::new();
    let drv = loader.driver();

    let adapter = cb.open_adapter(&host).unwrap();
    let device = cb.create_device(&adapter).unwrap();
    assert!(!device.buffers.command.is_null());

    let context = cb.create_context(&device, ContextKind::GL).unwrap();
    assert_eq!(context.kind, ContextKind::GL);
    assert_eq!(
        drv.current_buffers(context.handle).unwrap().command,
        context.buffers.command
    );
    assert!(drv.calls().contains(&Call::CreateContext {
        device: device.handle,
        if_version: VBOXWDDM_CONTEXT_IF_VERSION,
        context_type: VBOXWDDM_CONTEXT_TYPE_CUSTOM_UHGSMI_GL,
        client_hint: D3DKMT_CLIENTHINT_OPENGL,
    }));

    cb.destroy_context(&context).unwrap();
    cb.destroy_device(&device).unwrap();
    cb.close_adapter(&host, &adapter).unwrap();
    assert_eq!(drv.live_objects(), 0);
}

#[test]
fn context_failure_reported() {
    let (loader, cb) = loaded();
    let host = SimHost::new();
    let adapter = cb.open_adapter(&host).unwrap();
    let device = cb.create_device(&adapter).unwrap();

    loader.driver().fail_next(EntryPoint::CreateContext, STATUS_NO_MEMORY);
    match cb.create_context(&device, ContextKind::D3D) {
        Err(Error::Driver { op, status }) => {
            assert_eq!(op, "D3DKMTCreateContext");
            assert_eq!(status, STATUS_NO_MEMORY);
        }
        other => panic!("unexpected result {other:?}"),
    }
}
